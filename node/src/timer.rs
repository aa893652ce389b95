//! Timer wheel & fixed-timestep game loop (C7). Both are owned directly by
//! a stage's dispatcher loop (see `stage.rs`) and driven from its
//! `tokio::select!` per SPEC_FULL.md §9's "coroutine/async flow" note —
//! there is no background thread here, callbacks only ever run when the
//! owning dispatcher polls them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::handler::StageHandler;

pub type TimerId = u64;

type TimerCallback = Box<dyn FnMut(&mut dyn StageHandler, &crate::contracts::StageLink) + Send>;
type GameLoopCallback =
    Box<dyn FnMut(&mut dyn StageHandler, &crate::contracts::StageLink, Duration, Duration) + Send>;

enum TimerKind {
    Repeat,
    Count(u32),
}

struct TimerEntry {
    kind: TimerKind,
    period: Duration,
    callback: TimerCallback,
}

/// Lazily-deleted scheduled-callback queue: a min-heap of schedule hints
/// plus a map of live entries. Cancelling removes the map entry only; the
/// stale heap hint is filtered out the next time it's popped.
#[derive(Default)]
pub struct TimerWheel {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repeat(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        self.schedule(initial_delay, period, TimerKind::Repeat, callback)
    }

    pub fn add_count(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        count: u32,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        if count == 0 {
            return id;
        }
        self.schedule_with_id(id, initial_delay, period, TimerKind::Count(count), callback)
    }

    fn schedule(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        kind: TimerKind,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.schedule_with_id(id, initial_delay, period, kind, callback)
    }

    fn schedule_with_id(
        &mut self,
        id: TimerId,
        initial_delay: Duration,
        period: Duration,
        kind: TimerKind,
        callback: TimerCallback,
    ) -> TimerId {
        let next_fire = Instant::now() + initial_delay;
        self.entries.insert(id, TimerEntry { kind, period, callback });
        self.heap.push(Reverse((next_fire, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    #[must_use]
    pub fn has_timer(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    fn prune_stale(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.entries.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest wall-clock instant a live timer is due, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune_stale();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Fires every entry due at or before `now`, rescheduling repeats and
    /// decrementing counted timers, removing any that are exhausted.
    /// Returns the number of callbacks invoked.
    pub fn fire_due(
        &mut self,
        now: Instant,
        handler: &mut dyn StageHandler,
        link: &crate::contracts::StageLink,
    ) -> usize {
        let mut fired = 0;
        loop {
            self.prune_stale();
            let Some(Reverse((deadline, id))) = self.heap.peek().copied() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            (entry.callback)(handler, link);
            fired += 1;
            match &mut entry.kind {
                TimerKind::Repeat => {
                    let period = entry.period;
                    self.heap.push(Reverse((deadline + period, id)));
                }
                TimerKind::Count(remaining) => {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.entries.remove(&id);
                    } else {
                        let period = entry.period;
                        self.heap.push(Reverse((deadline + period, id)));
                    }
                }
            }
        }
        fired
    }
}

/// Fixed-timestep accumulator-model game loop. `advance` samples real time,
/// accumulates, and invokes `callback` zero or more times, each with
/// `deltaTime == fixed_timestep` exactly.
pub struct GameLoop {
    fixed_timestep: Duration,
    max_accumulator_cap: Duration,
    accumulator: Duration,
    last_sample: Instant,
    total_elapsed: Duration,
    callback: GameLoopCallback,
}

impl GameLoop {
    #[must_use]
    pub fn new(
        fixed_timestep: Duration,
        max_accumulator_cap: Duration,
        callback: GameLoopCallback,
    ) -> Self {
        Self {
            fixed_timestep,
            max_accumulator_cap,
            accumulator: Duration::ZERO,
            last_sample: Instant::now(),
            total_elapsed: Duration::ZERO,
            callback,
        }
    }

    #[must_use]
    pub const fn fixed_timestep(&self) -> Duration {
        self.fixed_timestep
    }

    pub fn advance(&mut self, handler: &mut dyn StageHandler, link: &crate::contracts::StageLink) {
        let now = Instant::now();
        let delta = now.saturating_duration_since(self.last_sample);
        self.last_sample = now;
        self.accumulator += delta;
        if self.accumulator > self.max_accumulator_cap {
            self.accumulator = self.max_accumulator_cap;
        }
        while self.accumulator >= self.fixed_timestep {
            self.accumulator -= self.fixed_timestep;
            self.total_elapsed += self.fixed_timestep;
            (self.callback)(handler, link, self.fixed_timestep, self.total_elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StageLink;
    use crate::handler::NoopStageHandler;

    fn noop_link() -> StageLink {
        crate::stage::test_support::stub_link(1, "test")
    }

    #[test]
    fn add_count_timer_fires_exact_count() {
        let mut wheel = TimerWheel::new();
        let mut handler = NoopStageHandler;
        let link = noop_link();
        let fires = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fires_cb = fires.clone();
        let id = wheel.add_count(
            Duration::ZERO,
            Duration::from_millis(1),
            3,
            Box::new(move |_h, _l| {
                fires_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(10));
        wheel.fire_due(Instant::now(), &mut handler, &link);
        assert_eq!(fires.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(!wheel.has_timer(id));
    }

    #[test]
    fn cancel_prevents_further_fires() {
        let mut wheel = TimerWheel::new();
        let mut handler = NoopStageHandler;
        let link = noop_link();
        let fires = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fires_cb = fires.clone();
        let id = wheel.add_repeat(
            Duration::ZERO,
            Duration::from_millis(1),
            Box::new(move |_h, _l| {
                fires_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        wheel.fire_due(Instant::now(), &mut handler, &link);
        assert!(wheel.cancel(id));
        assert!(!wheel.has_timer(id));
        let fired_before = fires.load(std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        wheel.fire_due(Instant::now(), &mut handler, &link);
        assert_eq!(fires.load(std::sync::atomic::Ordering::SeqCst), fired_before);
    }

    #[test]
    fn game_loop_delivers_exact_timestep() {
        let mut loop_ = GameLoop::new(Duration::from_millis(10), Duration::from_millis(200), {
            Box::new(|_h, _l, dt, _total| {
                assert_eq!(dt, Duration::from_millis(10));
            })
        });
        let mut handler = NoopStageHandler;
        let link = noop_link();
        std::thread::sleep(Duration::from_millis(35));
        loop_.advance(&mut handler, &link);
        assert!(loop_.accumulator < Duration::from_millis(10));
    }

    #[test]
    fn game_loop_caps_accumulator_after_long_pause() {
        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticks_cb = ticks.clone();
        let mut loop_ = GameLoop::new(Duration::from_millis(10), Duration::from_millis(50), {
            Box::new(move |_h, _l, _dt, _total| {
                ticks_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        });
        std::thread::sleep(Duration::from_millis(300));
        let mut handler = NoopStageHandler;
        let link = noop_link();
        loop_.advance(&mut handler, &link);
        // Capped at 50ms / 10ms per tick = 5 ticks, not ~30.
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) <= 5);
    }
}
