//! Async offload (C8): the two process-wide pools CPU-bound and
//! blocking-I/O-bound application work runs on, kept off the stage
//! dispatcher thread per SPEC_FULL.md §4.8. An explicit `init`/`shutdown`
//! pair around a process-wide singleton (§9 "Global state") rather than a
//! bare `tokio::spawn` with no admission control.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{NodeError, Result};

/// Error surfaced when an offloaded closure panics or is dropped before
/// completion. Carried into the `post` continuation as `Err(..)` per
/// SPEC_FULL.md §4.8 ("exceptions in `pre` propagate into `post` as an
/// error object").
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("offloaded task panicked: {0}")]
    Panicked(String),

    #[error("async pools are not initialized or have been shut down")]
    NotActive,
}

/// The compute pool (CPU-bound work) and I/O pool (blocking I/O), each
/// bounded by a semaphore sized per `PoolsConfig`. This is one of the two
/// process-wide singletons named in SPEC_FULL.md §9 ("Global state") — a
/// node constructs exactly one and shares it via `Arc` with every stage.
pub struct AsyncPools {
    compute: Arc<Semaphore>,
    io: Arc<Semaphore>,
    active: AtomicBool,
}

impl AsyncPools {
    /// `init(config)`: constructs the pools and marks them active. Must be
    /// called exactly once before any stage attempts to offload work.
    #[must_use]
    pub fn init(compute_concurrency: usize, io_concurrency: usize) -> Self {
        Self {
            compute: Arc::new(Semaphore::new(compute_concurrency.max(1))),
            io: Arc::new(Semaphore::new(io_concurrency.max(1))),
            active: AtomicBool::new(true),
        }
    }

    /// Marks the pools inactive. Offload calls made after `shutdown` fail
    /// fast with [`OffloadError::NotActive`] instead of silently running.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> std::result::Result<(), OffloadError> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OffloadError::NotActive)
        }
    }

    /// Runs `f` on the compute pool (`tokio::task::spawn_blocking`, bounded
    /// by the compute semaphore) and returns its result. `f` MUST NOT touch
    /// stage state — it runs off the stage dispatcher thread.
    pub async fn run_compute<T, F>(&self, f: F) -> std::result::Result<T, OffloadError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.ensure_active()?;
        let permit = self
            .compute
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OffloadError::NotActive)?;
        let joined = tokio::task::spawn_blocking(move || {
            let result = f();
            drop(permit);
            result
        })
        .await;
        joined.map_err(|e| OffloadError::Panicked(e.to_string()))
    }

    /// Runs `f` on the I/O pool (`tokio::spawn`, bounded by the I/O
    /// semaphore). `f` returns a future that is polled to completion before
    /// the result is handed back.
    pub async fn run_io<T, Fut, F>(&self, f: F) -> std::result::Result<T, OffloadError>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
    {
        self.ensure_active()?;
        let permit = self
            .io
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OffloadError::NotActive)?;
        let joined = tokio::spawn(async move {
            let result = f().await;
            drop(permit);
            result
        })
        .await;
        joined.map_err(|e| OffloadError::Panicked(e.to_string()))
    }
}

impl From<OffloadError> for NodeError {
    fn from(value: OffloadError) -> Self {
        NodeError::Internal(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_compute_executes_and_returns_result() {
        let pools = AsyncPools::init(2, 2);
        let result = pools.run_compute(|| 2 + 2).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn run_io_awaits_the_inner_future() {
        let pools = AsyncPools::init(2, 2);
        let result = pools
            .run_io(|| async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                "done"
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn shutdown_rejects_further_offload() {
        let pools = AsyncPools::init(1, 1);
        pools.shutdown();
        let err = pools.run_compute(|| 1).await.unwrap_err();
        assert!(matches!(err, OffloadError::NotActive));
    }

    #[tokio::test]
    async fn panic_in_pre_surfaces_as_offload_error() {
        let pools = AsyncPools::init(1, 1);
        let err = pools
            .run_compute(|| -> i32 { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::Panicked(_)));
    }

    #[tokio::test]
    async fn compute_pool_bounds_concurrency() {
        use std::sync::atomic::AtomicUsize;

        let pools = Arc::new(AsyncPools::init(1, 4));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pools = pools.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                pools
                    .run_compute(move || {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
