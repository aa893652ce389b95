//! Actor/Stage public contracts (C10): the facade types application code
//! sees. `PacketView` is the handler-facing wrapper around a wire
//! [`protocol::Packet`]; `StageLink`/`ActorLink` are the handles a
//! `StageHandler` uses to reach back into the framework (timers, game loop,
//! offload, outbound routing) without touching the dispatcher's internals
//! directly — the handle wraps an `mpsc::Sender` rather than exposing the
//! dispatcher's owned state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::{NodeId, Packet, ServiceId};
use tokio::sync::oneshot;

use crate::error::{NodeError, Result};
use crate::handler::StageHandler;
use crate::mesh::RouteDispatcher;
use crate::registry::{NodeRegistry, SelectionPolicy};
use crate::session::SessionTable;
use crate::stage::{DispatcherShared, StageCommand};
use crate::timer::TimerId;

/// Handler-facing view over one client [`Packet`]. Header fields may be
/// read any number of times; the payload is owned and may be taken exactly
/// once via [`PacketView::take_payload`].
#[derive(Debug)]
pub struct PacketView {
    msg_id: String,
    msg_seq: u16,
    stage_id: i64,
    error_code: u16,
    payload: Option<Vec<u8>>,
}

impl PacketView {
    #[must_use]
    pub fn from_packet(packet: Packet) -> Self {
        Self {
            msg_id: packet.msg_id,
            msg_seq: packet.msg_seq,
            stage_id: packet.stage_id,
            error_code: packet.error_code,
            payload: Some(packet.payload),
        }
    }

    #[must_use]
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    #[must_use]
    pub const fn msg_seq(&self) -> u16 {
        self.msg_seq
    }

    #[must_use]
    pub const fn stage_id(&self) -> i64 {
        self.stage_id
    }

    #[must_use]
    pub const fn error_code(&self) -> u16 {
        self.error_code
    }

    #[must_use]
    pub const fn is_push(&self) -> bool {
        self.msg_seq == 0
    }

    /// Reads the payload without consuming it.
    pub fn payload(&self) -> Result<&[u8]> {
        self.payload.as_deref().ok_or(NodeError::InvalidMessage)
    }

    /// Takes ownership of the payload. Calling this a second time on the
    /// same view returns [`NodeError::InvalidMessage`].
    pub fn take_payload(&mut self) -> Result<Vec<u8>> {
        self.payload.take().ok_or(NodeError::InvalidMessage)
    }
}

/// Outcome of reply-shaped `pre`-style async offload: either the closure's
/// result, or the error it failed with.
pub type OffloadOutcome<T> = std::result::Result<T, crate::offload::OffloadError>;

/// Handle a `StageHandler` uses to reach back into the framework. Cheap to
/// clone; every clone addresses the same stage.
#[derive(Clone)]
pub struct StageLink {
    stage_id: i64,
    stage_type: Arc<str>,
    self_node_id: NodeId,
    shared: Arc<Mutex<DispatcherShared>>,
    mailbox: tokio::sync::mpsc::UnboundedSender<StageCommand>,
    pools: Arc<crate::offload::AsyncPools>,
    registry: NodeRegistry,
    route_dispatcher: Arc<RouteDispatcher>,
    sessions: Arc<SessionTable>,
    closed: Arc<AtomicBool>,
}

impl StageLink {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stage_id: i64,
        stage_type: Arc<str>,
        self_node_id: NodeId,
        shared: Arc<Mutex<DispatcherShared>>,
        mailbox: tokio::sync::mpsc::UnboundedSender<StageCommand>,
        pools: Arc<crate::offload::AsyncPools>,
        registry: NodeRegistry,
        route_dispatcher: Arc<RouteDispatcher>,
        sessions: Arc<SessionTable>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stage_id,
            stage_type,
            self_node_id,
            shared,
            mailbox,
            pools,
            registry,
            route_dispatcher,
            sessions,
            closed,
        }
    }

    #[must_use]
    pub const fn stage_id(&self) -> i64 {
        self.stage_id
    }

    #[must_use]
    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<SessionTable> {
        self.sessions.clone()
    }

    pub fn add_repeat_timer(
        &self,
        initial_delay: Duration,
        period: Duration,
        callback: impl FnMut(&mut dyn StageHandler, &StageLink) + Send + 'static,
    ) -> TimerId {
        let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.timers.add_repeat(initial_delay, period, Box::new(callback))
    }

    pub fn add_count_timer(
        &self,
        initial_delay: Duration,
        period: Duration,
        count: u32,
        callback: impl FnMut(&mut dyn StageHandler, &StageLink) + Send + 'static,
    ) -> TimerId {
        let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.timers.add_count(initial_delay, period, count, Box::new(callback))
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.timers.cancel(id)
    }

    #[must_use]
    pub fn has_timer(&self, id: TimerId) -> bool {
        let shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.timers.has_timer(id)
    }

    pub fn start_game_loop(
        &self,
        fixed_timestep: Duration,
        min: Duration,
        max: Duration,
        max_accumulator_cap: Duration,
        callback: impl FnMut(&mut dyn StageHandler, &StageLink, Duration, Duration) + Send + 'static,
    ) -> Result<()> {
        if fixed_timestep < min || fixed_timestep > max {
            return Err(NodeError::ArgumentOutOfRange(fixed_timestep.as_millis() as u64));
        }
        let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
        if shared.game_loop.is_some() {
            return Err(NodeError::GameLoopAlreadyRunning);
        }
        shared.game_loop = Some(crate::timer::GameLoop::new(
            fixed_timestep,
            max_accumulator_cap,
            Box::new(callback),
        ));
        Ok(())
    }

    pub fn stop_game_loop(&self) {
        let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.game_loop = None;
    }

    #[must_use]
    pub fn is_game_loop_running(&self) -> bool {
        let shared = self.shared.lock().expect("dispatcher mutex poisoned");
        shared.game_loop.is_some()
    }

    /// Runs `pre` on the compute pool; if `post` is supplied, its
    /// continuation is posted back into this stage's mailbox.
    pub fn async_compute<T, F, P>(&self, pre: F, post: Option<P>)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        P: FnOnce(&mut dyn StageHandler, &StageLink, OffloadOutcome<T>) + Send + 'static,
    {
        let pools = self.pools.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = pools.run_compute(pre).await;
            if let Some(post) = post {
                let _ = mailbox.send(StageCommand::OffloadCompletion(Box::new(move |h, l| {
                    post(h, l, result)
                })));
            }
        });
    }

    /// Runs `pre` on the I/O pool; same completion-posting contract as
    /// [`StageLink::async_compute`].
    pub fn async_io<T, Fut, F, P>(&self, pre: F, post: Option<P>)
    where
        T: Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        P: FnOnce(&mut dyn StageHandler, &StageLink, OffloadOutcome<T>) + Send + 'static,
    {
        let pools = self.pools.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = pools.run_io(pre).await;
            if let Some(post) = post {
                let _ = mailbox.send(StageCommand::OffloadCompletion(Box::new(move |h, l| {
                    post(h, l, result)
                })));
            }
        });
    }

    pub fn close_stage(&self) {
        let _ = self.mailbox.send(StageCommand::Close);
    }

    pub fn send_to_client(&self, session_node_id: &NodeId, session_id: i64, packet: Packet) {
        if session_node_id == &self.self_node_id {
            self.sessions.push(session_id, packet);
            return;
        }
        self.route_dispatcher.send_push_to_node(
            self.self_node_id.clone(),
            session_node_id.clone(),
            ServiceId::Play,
            String::new(),
            Some(session_node_id.clone()),
            Some(session_id),
            packet,
        );
    }

    pub fn send_to_api(&self, node_id: &NodeId, packet: Packet) {
        self.route_dispatcher
            .send(node_id.clone(), self.self_node_id.clone(), packet, String::new());
    }

    pub async fn request_to_api(&self, node_id: &NodeId, packet: Packet) -> Result<Packet> {
        self.route_dispatcher
            .send_request(node_id.clone(), self.self_node_id.clone(), packet, String::new())
            .await
    }

    pub async fn request_to_api_service(
        &self,
        service_id: ServiceId,
        packet: Packet,
        policy: SelectionPolicy,
    ) -> Result<Packet> {
        let target = self.registry.select(service_id, &policy)?;
        self.request_to_api(&target, packet).await
    }

    pub async fn request_to_stage(
        &self,
        target_stage_type: &str,
        target_stage_id: i64,
        packet: Packet,
    ) -> Result<Packet> {
        let mut packet = packet;
        packet.stage_id = target_stage_id;
        self.route_dispatcher
            .send_request_to_stage(
                self.self_node_id.clone(),
                target_stage_type.to_string(),
                packet,
            )
            .await
    }
}

/// Handle a `StageHandler` uses to interact with one joined Actor.
#[derive(Clone)]
pub struct ActorLink {
    account_id: Arc<Mutex<Option<String>>>,
    session_id: i64,
    session_node_id: NodeId,
    stage_link: StageLink,
    pending_client_requests: Arc<SessionTable>,
}

impl ActorLink {
    pub(crate) fn new(
        session_id: i64,
        session_node_id: NodeId,
        stage_link: StageLink,
        pending_client_requests: Arc<SessionTable>,
    ) -> Self {
        Self {
            account_id: Arc::new(Mutex::new(None)),
            session_id,
            session_node_id,
            stage_link,
            pending_client_requests,
        }
    }

    #[must_use]
    pub fn account_id(&self) -> Option<String> {
        self.account_id.lock().expect("actor mutex poisoned").clone()
    }

    #[must_use]
    pub const fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Sets `accountId` exactly once, as required by `OnAuthenticate`
    /// (I5). Returns `false` if it was already set.
    pub fn set_account_id(&self, account_id: impl Into<String>) -> bool {
        let mut slot = self.account_id.lock().expect("actor mutex poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(account_id.into());
        true
    }

    pub fn reply(&self, packet: Packet) {
        self.stage_link
            .send_to_client(&self.session_node_id, self.session_id, packet);
    }

    pub fn send_to_client(&self, packet: Packet) {
        self.stage_link
            .send_to_client(&self.session_node_id, self.session_id, packet);
    }

    /// Sends a server-initiated request-shaped packet to the fronting
    /// client and awaits its reply. Fails with `TooManyPendingRequests` if
    /// the session already has `maxPendingRequestsPerSession` requests
    /// outstanding (SPEC_FULL.md §3).
    pub async fn request(&self, packet: Packet) -> Result<Packet> {
        let (tx, rx) = oneshot::channel();
        if !self
            .pending_client_requests
            .register_client_request(self.session_id, packet.msg_seq, tx)
        {
            return Err(NodeError::TooManyPendingRequests);
        }
        self.stage_link
            .send_to_client(&self.session_node_id, self.session_id, packet);
        rx.await.map_err(|_| NodeError::StageClosed)
    }
}
