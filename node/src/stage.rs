//! Stage dispatcher (C6) — the core of the core. Each Stage runs its own
//! single-threaded logical executor: a `tokio::select!` loop over a
//! mailbox, its timer wheel, and its game loop — the same shape as a
//! single map's command+tick loop, spread here across every stage
//! instance instead of one task per game map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{info, warn};
use protocol::{NodeId, Packet};
use tokio::sync::{mpsc, oneshot};

use crate::config::NodeConfig;
use crate::contracts::{ActorLink, PacketView, StageLink};
use crate::error::{NodeError, Result};
use crate::handler::{DispatchOutcome, LeaveReason, StageHandler, StageHandlerRegistry};
use crate::mesh::RouteDispatcher;
use crate::offload::AsyncPools;
use crate::registry::NodeRegistry;
use crate::session::SessionTable;
use crate::timer::{GameLoop, TimerWheel};

/// Reserved `msgId` for the cross-node `CreateStage` RPC issued by
/// `ApiLink::create_stage` (C9). Never visible to application handlers.
pub const CREATE_STAGE_MSG_ID: &str = "$playhouse.create_stage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Joined,
    Paused,
}

struct ActorRecord {
    session_id: i64,
    session_node_id: NodeId,
    state: ActorState,
    paused_since: Option<Instant>,
    link: ActorLink,
}

/// Timer wheel + optional game loop, the only per-stage state reachable
/// from outside the dispatcher loop (through `StageLink`, behind a mutex
/// only to satisfy `Send`; see DESIGN.md).
#[derive(Default)]
pub struct DispatcherShared {
    pub timers: TimerWheel,
    pub game_loop: Option<GameLoop>,
}

type OffloadCompletion = Box<dyn FnOnce(&mut dyn StageHandler, &StageLink) + Send>;

pub enum StageCommand {
    /// The very first message posted to a newly spawned stage: runs
    /// `OnCreate`/`OnPostCreate` before anything else is processed.
    /// `reply_to` is populated only when creation was requested remotely
    /// via `CreateStage`, so the RPC caller can be answered.
    Create {
        create_packet: Packet,
        reply_to: Option<oneshot::Sender<Packet>>,
    },
    /// A client packet naming this stage. `is_authenticate` is set by the
    /// session layer when the packet's `msgId` matches the configured
    /// `authenticateMessageId`; everything else is a post-join dispatch.
    ClientPacket {
        packet: Packet,
        session_id: i64,
        session_node_id: NodeId,
        is_authenticate: bool,
    },
    /// An inter-node or same-node cross-stage packet, optionally expecting
    /// a reply.
    RemoteDispatch {
        packet: Packet,
        reply_to: Option<oneshot::Sender<Packet>>,
    },
    ActorDisconnected { session_id: i64 },
    ActorReconnected {
        account_id: String,
        session_id: i64,
        session_node_id: NodeId,
    },
    OffloadCompletion(OffloadCompletion),
    Close,
}

/// Cheap, cloneable handle to a running stage's mailbox. Stored in the
/// `StageRegistry`.
#[derive(Clone)]
pub struct StageDispatcherHandle {
    stage_id: i64,
    stage_type: Arc<str>,
    mailbox: mpsc::UnboundedSender<StageCommand>,
}

impl StageDispatcherHandle {
    #[must_use]
    pub const fn stage_id(&self) -> i64 {
        self.stage_id
    }

    #[must_use]
    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    pub fn deliver_client_packet(
        &self,
        packet: Packet,
        session_id: i64,
        session_node_id: NodeId,
        is_authenticate: bool,
    ) {
        let _ = self.mailbox.send(StageCommand::ClientPacket {
            packet,
            session_id,
            session_node_id,
            is_authenticate,
        });
    }

    pub fn actor_disconnected(&self, session_id: i64) {
        let _ = self.mailbox.send(StageCommand::ActorDisconnected { session_id });
    }

    pub fn actor_reconnected(&self, account_id: String, session_id: i64, session_node_id: NodeId) {
        let _ = self.mailbox.send(StageCommand::ActorReconnected {
            account_id,
            session_id,
            session_node_id,
        });
    }

    pub fn dispatch_push(&self, packet: Packet) {
        let _ = self
            .mailbox
            .send(StageCommand::RemoteDispatch { packet, reply_to: None });
    }

    /// Local or remote request/reply round trip against this stage.
    pub async fn request(&self, packet: Packet) -> Result<Packet> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(StageCommand::RemoteDispatch { packet, reply_to: Some(tx) })
            .map_err(|_| NodeError::StageClosed)?;
        rx.await.map_err(|_| NodeError::StageClosed)
    }

    pub fn close(&self) {
        let _ = self.mailbox.send(StageCommand::Close);
    }
}

/// Registry of every running stage on this node, keyed by `(stageType,
/// stageId)`. Spawns a fresh dispatcher task on first reference.
pub struct StageRegistry {
    stages: DashMap<(String, i64), StageDispatcherHandle>,
    handlers: Arc<StageHandlerRegistry>,
    pools: Arc<AsyncPools>,
    node_registry: NodeRegistry,
    route_dispatcher: Arc<RouteDispatcher>,
    sessions: Arc<SessionTable>,
    self_node_id: NodeId,
    config: Arc<NodeConfig>,
}

impl StageRegistry {
    #[must_use]
    pub fn new(
        handlers: Arc<StageHandlerRegistry>,
        pools: Arc<AsyncPools>,
        node_registry: NodeRegistry,
        route_dispatcher: Arc<RouteDispatcher>,
        sessions: Arc<SessionTable>,
        self_node_id: NodeId,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            stages: DashMap::new(),
            handlers,
            pools,
            node_registry,
            route_dispatcher,
            sessions,
            self_node_id,
            config,
        }
    }

    #[must_use]
    pub fn lookup(&self, stage_type: &str, stage_id: i64) -> Option<StageDispatcherHandle> {
        self.stages.get(&(stage_type.to_string(), stage_id)).map(|e| e.clone())
    }

    #[must_use]
    pub fn self_node_id(&self) -> &NodeId {
        &self.self_node_id
    }

    /// Resolves the `stageType` a session should join when authenticating,
    /// since the client wire format carries only `stageId`: the
    /// configured default, or the sole registered handler if exactly one
    /// is registered.
    #[must_use]
    pub fn resolve_default_stage_type(&self) -> Option<String> {
        let configured = &self.config.default_stage_type;
        if !configured.is_empty() && self.handlers.contains(configured) {
            return Some(configured.clone());
        }
        self.handlers.sole_registered_type()
    }

    /// Gets the existing stage, or creates it (spawning a dispatcher task
    /// and enqueueing `OnCreate`) if `create_packet` is provided and no
    /// stage exists yet.
    pub fn get_or_create(
        &self,
        stage_type: &str,
        stage_id: i64,
        create_packet: Option<Packet>,
    ) -> Result<StageDispatcherHandle> {
        let key = (stage_type.to_string(), stage_id);
        if let Some(existing) = self.stages.get(&key) {
            return Ok(existing.clone());
        }

        if !self.handlers.contains(stage_type) {
            return Err(NodeError::InvalidStageType(stage_type.to_string()));
        }

        let handle = match self.stages.entry(key) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let handler = self
                    .handlers
                    .create(stage_type)
                    .ok_or_else(|| NodeError::InvalidStageType(stage_type.to_string()))?;
                let handle = self.spawn(stage_type, stage_id, handler);
                slot.insert(handle.clone());
                handle
            }
        };

        if let Some(create_packet) = create_packet {
            let _ = handle
                .mailbox
                .send(StageCommand::Create { create_packet, reply_to: None });
        }
        Ok(handle)
    }

    fn spawn(
        &self,
        stage_type: &str,
        stage_id: i64,
        handler: Box<dyn StageHandler>,
    ) -> StageDispatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stage_type: Arc<str> = Arc::from(stage_type);

        let dispatcher_shared = Arc::new(std::sync::Mutex::new(DispatcherShared::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let link = StageLink::new(
            stage_id,
            stage_type.clone(),
            self.self_node_id.clone(),
            dispatcher_shared.clone(),
            tx.clone(),
            self.pools.clone(),
            self.node_registry.clone(),
            self.route_dispatcher.clone(),
            self.sessions.clone(),
            closed.clone(),
        );

        let dispatcher_loop = DispatcherLoop {
            stage_id,
            stage_type: stage_type.clone(),
            handler,
            link,
            shared: dispatcher_shared,
            closed,
            actors: HashMap::new(),
            actors_by_session: HashMap::new(),
            actor_paused_window: self.config.timeouts.actor_paused_window(),
            mailbox: rx,
        };

        tokio::spawn(dispatcher_loop.run());

        StageDispatcherHandle {
            stage_id,
            stage_type,
            mailbox: tx,
        }
    }

    /// Classifies an inbound inter-node route packet destined for this
    /// node's Play service and hands it to the target stage, replying
    /// over the mesh if the packet was request-shaped. A packet for a
    /// stage that doesn't exist here gets a `StageNotFound` reply (or is
    /// dropped, for a push).
    pub fn deliver_remote(&self, route: protocol::RoutePacket) {
        let stage_id = route.stage_id;
        let msg_seq = route.msg_seq;
        let from = route.from.clone();
        let msg_id = route.msg_id.clone();
        let packet = route.into_packet();

        let Some(handle) = self.first_handle_for_stage_id(stage_id) else {
            warn!("remote packet for unknown stage {stage_id}, dropping");
            if msg_seq != 0 {
                self.reply_over_mesh(
                    from,
                    Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::StageNotFound.code(), Vec::new()),
                );
            }
            return;
        };

        if msg_seq == 0 {
            handle.dispatch_push(packet);
            return;
        }

        let route_dispatcher = self.route_dispatcher.clone();
        let self_node_id = self.self_node_id.clone();
        tokio::spawn(async move {
            let reply = match handle.request(packet).await {
                Ok(reply) => reply,
                Err(e) => Packet::reply(msg_id, msg_seq, stage_id, e.error_code().code(), Vec::new()),
            };
            route_dispatcher.send_push_to_node(self_node_id, from, protocol::ServiceId::Play, String::new(), None, None, reply);
        });
    }

    fn reply_over_mesh(&self, to: NodeId, reply: Packet) {
        self.route_dispatcher.send_push_to_node(
            self.self_node_id.clone(),
            to,
            protocol::ServiceId::Play,
            String::new(),
            None,
            None,
            reply,
        );
    }

    fn first_handle_for_stage_id(&self, stage_id: i64) -> Option<StageDispatcherHandle> {
        self.stages.iter().find(|e| e.key().1 == stage_id).map(|e| e.value().clone())
    }

    /// Handles an inbound `CreateStage` RPC (§4.9): decodes the request,
    /// creates the stage locally, and replies over the mesh with
    /// `OnCreate`'s outcome once it resolves.
    pub fn handle_create_stage_route(&self, route: protocol::RoutePacket) {
        let from = route.from.clone();
        let msg_seq = route.msg_seq;

        let request: crate::api::CreateStageRequest = match postcard::from_bytes(&route.payload) {
            Ok(r) => r,
            Err(_) => {
                if msg_seq != 0 {
                    self.reply_over_mesh(
                        from,
                        Packet::reply(CREATE_STAGE_MSG_ID, msg_seq, route.stage_id, protocol::ErrorCode::InvalidMessage.code(), Vec::new()),
                    );
                }
                return;
            }
        };

        match self.create_stage_remote(&request.stage_type, request.stage_id, request.payload) {
            Ok(rx) => {
                let route_dispatcher = self.route_dispatcher.clone();
                let self_node_id = self.self_node_id.clone();
                let stage_id = request.stage_id;
                tokio::spawn(async move {
                    let reply = rx.await.unwrap_or_else(|_| {
                        Packet::reply(CREATE_STAGE_MSG_ID, msg_seq, stage_id, protocol::ErrorCode::StageCreationFailed.code(), Vec::new())
                    });
                    if msg_seq != 0 {
                        route_dispatcher.send_push_to_node(self_node_id, from, protocol::ServiceId::Play, String::new(), None, None, reply);
                    }
                });
            }
            Err(e) if msg_seq != 0 => {
                self.reply_over_mesh(
                    from,
                    Packet::reply(CREATE_STAGE_MSG_ID, msg_seq, request.stage_id, e.error_code().code(), Vec::new()),
                );
            }
            Err(_) => {}
        }
    }

    /// Creates a stage on this node on behalf of a remote `CreateStage`
    /// RPC, returning a channel resolved with `OnCreate`'s reply.
    pub fn create_stage_remote(&self, stage_type: &str, stage_id: i64, payload: Vec<u8>) -> Result<oneshot::Receiver<Packet>> {
        let key = (stage_type.to_string(), stage_id);
        if self.stages.contains_key(&key) {
            return Err(NodeError::StageAlreadyExists(stage_id));
        }
        if !self.handlers.contains(stage_type) {
            return Err(NodeError::InvalidStageType(stage_type.to_string()));
        }

        let handle = match self.stages.entry(key) {
            Entry::Occupied(existing) => return Err(NodeError::StageAlreadyExists(existing.get().stage_id())),
            Entry::Vacant(slot) => {
                let handler = self
                    .handlers
                    .create(stage_type)
                    .ok_or_else(|| NodeError::InvalidStageType(stage_type.to_string()))?;
                let handle = self.spawn(stage_type, stage_id, handler);
                slot.insert(handle.clone());
                handle
            }
        };

        let (tx, rx) = oneshot::channel();
        let create_packet = Packet::request(CREATE_STAGE_MSG_ID, 0, stage_id, payload);
        let _ = handle
            .mailbox
            .send(StageCommand::Create { create_packet, reply_to: Some(tx) });
        Ok(rx)
    }
}

struct DispatcherLoop {
    stage_id: i64,
    stage_type: Arc<str>,
    handler: Box<dyn StageHandler>,
    link: StageLink,
    shared: Arc<std::sync::Mutex<DispatcherShared>>,
    closed: Arc<AtomicBool>,
    actors: HashMap<String, ActorRecord>,
    actors_by_session: HashMap<i64, String>,
    actor_paused_window: Duration,
    mailbox: mpsc::UnboundedReceiver<StageCommand>,
}

impl DispatcherLoop {
    async fn run(mut self) {
        info!("stage {}/{} dispatcher started", self.stage_type, self.stage_id);
        loop {
            let next_timer_deadline = {
                let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
                shared.timers.next_deadline()
            };
            let game_loop_step = {
                let shared = self.shared.lock().expect("dispatcher mutex poisoned");
                shared.game_loop.as_ref().map(GameLoop::fixed_timestep)
            };

            tokio::select! {
                biased;

                maybe_cmd = self.mailbox.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                () = sleep_until_or_pending(next_timer_deadline) => {
                    let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
                    shared.timers.fire_due(Instant::now(), self.handler.as_mut(), &self.link);
                }

                () = sleep_for_or_pending(game_loop_step) => {
                    let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
                    if let Some(game_loop) = shared.game_loop.as_mut() {
                        game_loop.advance(self.handler.as_mut(), &self.link);
                    }
                }
            }

            self.expire_paused_actors().await;
        }

        info!("stage {}/{} dispatcher stopped", self.stage_type, self.stage_id);
    }

    /// Returns `true` when the dispatcher loop should exit.
    async fn handle_command(&mut self, cmd: StageCommand) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }

        match cmd {
            StageCommand::Create { create_packet, reply_to } => self.handle_create(create_packet, reply_to).await,

            StageCommand::ClientPacket { packet, session_id, session_node_id, is_authenticate } => {
                if is_authenticate {
                    self.handle_join(packet, session_id, session_node_id).await;
                } else {
                    self.handle_client_dispatch(packet, session_id, session_node_id).await;
                }
                false
            }

            StageCommand::RemoteDispatch { packet, reply_to } => {
                self.handle_remote_dispatch(packet, reply_to).await;
                false
            }

            StageCommand::ActorDisconnected { session_id } => {
                self.handle_disconnect(session_id).await;
                false
            }

            StageCommand::ActorReconnected { account_id, session_id, session_node_id } => {
                self.handle_reconnect(account_id, session_id, session_node_id).await;
                false
            }

            StageCommand::OffloadCompletion(completion) => {
                completion(self.handler.as_mut(), &self.link);
                false
            }

            StageCommand::Close => {
                self.handle_close().await;
                true
            }
        }
    }

    async fn handle_create(&mut self, create_packet: Packet, reply_to: Option<oneshot::Sender<Packet>>) -> bool {
        let msg_seq = create_packet.msg_seq;
        let stage_id = self.stage_id;
        let view = PacketView::from_packet(create_packet);
        let outcome = self.handler.on_create(view, &self.link).await;

        if !outcome.ok {
            self.closed.store(true, Ordering::SeqCst);
            if let Some(reply_to) = reply_to {
                let reply = outcome.reply.unwrap_or_else(|| {
                    Packet::reply(CREATE_STAGE_MSG_ID, msg_seq, stage_id, protocol::ErrorCode::StageCreationFailed.code(), Vec::new())
                });
                let _ = reply_to.send(reply);
            }
            return true;
        }

        self.handler.on_post_create(&self.link).await;
        if let Some(reply_to) = reply_to {
            let reply = outcome
                .reply
                .unwrap_or_else(|| Packet::reply(CREATE_STAGE_MSG_ID, msg_seq, stage_id, 0, Vec::new()));
            let _ = reply_to.send(reply);
        }
        false
    }

    async fn handle_join(&mut self, auth_packet: Packet, session_id: i64, session_node_id: NodeId) {
        let msg_seq = auth_packet.msg_seq;
        let msg_id = auth_packet.msg_id.clone();
        let stage_id = self.stage_id;

        let actor_link = ActorLink::new(
            session_id,
            session_node_id.clone(),
            self.link.clone(),
            self.link.sessions(),
        );

        let view = PacketView::from_packet(auth_packet);
        let outcome = self.handler.on_authenticate(view, &actor_link, &self.link).await;
        let account_id = actor_link.account_id();

        if !outcome.ok || account_id.as_deref().map(str::is_empty).unwrap_or(true) {
            self.link.send_to_client(
                &session_node_id,
                session_id,
                Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::AuthenticationFailed.code(), Vec::new()),
            );
            return;
        }
        let account_id = account_id.unwrap();

        self.handler.on_post_authenticate(&actor_link, &self.link).await;

        let accepted = self.handler.on_join_stage(&actor_link, &self.link).await;
        if !accepted {
            self.link.send_to_client(
                &session_node_id,
                session_id,
                Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::JoinStageRejected.code(), Vec::new()),
            );
            return;
        }

        self.actors.insert(
            account_id.clone(),
            ActorRecord {
                session_id,
                session_node_id: session_node_id.clone(),
                state: ActorState::Joined,
                paused_since: None,
                link: actor_link.clone(),
            },
        );
        self.actors_by_session.insert(session_id, account_id);
        self.link.sessions().mark_authenticated(session_id, self.stage_type.to_string());

        self.handler.on_post_join_stage(&actor_link, &self.link).await;

        if let Some(reply) = outcome.reply {
            self.link.send_to_client(
                &session_node_id,
                session_id,
                Packet::reply(reply.msg_id, msg_seq, stage_id, reply.error_code, reply.payload),
            );
        }
    }

    async fn handle_client_dispatch(&mut self, packet: Packet, session_id: i64, session_node_id: NodeId) {
        let is_request = !packet.is_push();
        let msg_seq = packet.msg_seq;
        let msg_id = packet.msg_id.clone();
        let stage_id = self.stage_id;

        let Some(account_id) = self.actors_by_session.get(&session_id).cloned() else {
            if is_request {
                self.link.send_to_client(
                    &session_node_id,
                    session_id,
                    Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::NotAuthenticated.code(), Vec::new()),
                );
            }
            return;
        };
        let actor_link = self.actors.get(&account_id).map(|a| a.link.clone());

        let view = PacketView::from_packet(packet);
        let outcome = self.handler.on_dispatch(actor_link.as_ref(), view, &self.link).await;

        if !outcome.handled {
            if is_request {
                self.link.send_to_client(
                    &session_node_id,
                    session_id,
                    Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::HandlerNotFound.code(), Vec::new()),
                );
            }
            return;
        }
        if let Some(reply) = outcome.reply {
            self.link.send_to_client(&session_node_id, session_id, reply);
        }
    }

    async fn handle_remote_dispatch(&mut self, packet: Packet, reply_to: Option<oneshot::Sender<Packet>>) {
        let msg_seq = packet.msg_seq;
        let msg_id = packet.msg_id.clone();
        let stage_id = self.stage_id;
        let view = PacketView::from_packet(packet);
        let outcome = self.handler.on_dispatch(None, view, &self.link).await;

        if let Some(reply_to) = reply_to {
            let reply = outcome
                .reply
                .unwrap_or_else(|| Packet::reply(msg_id, msg_seq, stage_id, 0, Vec::new()));
            let _ = reply_to.send(reply);
            return;
        }

        if !outcome.handled {
            warn!("unhandled inter-node push for msgId {msg_id:?}");
        }
    }

    async fn handle_disconnect(&mut self, session_id: i64) {
        let Some(account_id) = self.actors_by_session.get(&session_id).cloned() else { return };
        let Some(record) = self.actors.get_mut(&account_id) else { return };
        record.state = ActorState::Paused;
        record.paused_since = Some(Instant::now());
        let link = record.link.clone();
        self.handler.on_connection_changed(&link, false, &self.link).await;
    }

    async fn handle_reconnect(&mut self, account_id: String, session_id: i64, session_node_id: NodeId) {
        let Some(record) = self.actors.get_mut(&account_id) else { return };
        let old_session_id = record.session_id;
        self.actors_by_session.remove(&old_session_id);
        record.session_id = session_id;
        record.session_node_id = session_node_id;
        record.state = ActorState::Joined;
        record.paused_since = None;
        self.actors_by_session.insert(session_id, account_id.clone());
        let link = self.actors.get(&account_id).map(|a| a.link.clone());
        if let Some(link) = link {
            self.handler.on_connection_changed(&link, true, &self.link).await;
        }
    }

    /// Expires actors whose paused window elapsed without a reconnect,
    /// treating them as departed.
    async fn expire_paused_actors(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .actors
            .iter()
            .filter_map(|(account_id, record)| match (record.state, record.paused_since) {
                (ActorState::Paused, Some(since)) if now.duration_since(since) >= self.actor_paused_window => {
                    Some(account_id.clone())
                }
                _ => None,
            })
            .collect();

        for account_id in expired {
            if let Some(record) = self.actors.remove(&account_id) {
                self.actors_by_session.remove(&record.session_id);
                self.link.sessions().clear_authenticated(record.session_id);
                self.handler
                    .on_leave_room(&record.link, LeaveReason::Timeout, &self.link)
                    .await;
            }
        }
    }

    async fn handle_close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut shared = self.shared.lock().expect("dispatcher mutex poisoned");
            shared.timers = TimerWheel::new();
            shared.game_loop = None;
        }
        let accounts: Vec<String> = self.actors.keys().cloned().collect();
        for account_id in accounts {
            if let Some(record) = self.actors.remove(&account_id) {
                self.actors_by_session.remove(&record.session_id);
                self.link.sessions().clear_authenticated(record.session_id);
                self.handler
                    .on_leave_room(&record.link, LeaveReason::Closed, &self.link)
                    .await;
                self.handler.on_actor_destroy(&record.link, &self.link).await;
            }
        }
        self.handler.on_destroy(&self.link).await;
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant.into()).await,
        None => std::future::pending().await,
    }
}

async fn sleep_for_or_pending(step: Option<Duration>) {
    match step {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn stub_link(stage_id: i64, stage_type: &str) -> StageLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        StageLink::new(
            stage_id,
            Arc::from(stage_type),
            NodeId::new(protocol::ServiceId::Play, "stub"),
            Arc::new(std::sync::Mutex::new(DispatcherShared::default())),
            tx,
            Arc::new(AsyncPools::init(1, 1)),
            NodeRegistry::from_entries(&[]),
            Arc::new(RouteDispatcher::new_stub()),
            Arc::new(SessionTable::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{AuthenticateOutcome, CreateOutcome};
    use async_trait::async_trait;

    struct EchoStage;

    #[async_trait]
    impl StageHandler for EchoStage {
        async fn on_create(&mut self, _create_packet: PacketView, _link: &StageLink) -> CreateOutcome {
            CreateOutcome::accept()
        }

        async fn on_authenticate(
            &mut self,
            _auth_packet: PacketView,
            actor: &ActorLink,
            _link: &StageLink,
        ) -> AuthenticateOutcome {
            actor.set_account_id("u1");
            AuthenticateOutcome { ok: true, reply: None }
        }

        async fn on_dispatch(
            &mut self,
            _actor: Option<&ActorLink>,
            mut packet: PacketView,
            _link: &StageLink,
        ) -> DispatchOutcome {
            let payload = packet.take_payload().unwrap_or_default();
            DispatchOutcome::ok(Some(Packet::reply(
                packet.msg_id().to_string(),
                packet.msg_seq(),
                packet.stage_id(),
                0,
                payload,
            )))
        }
    }

    fn handler_registry() -> Arc<StageHandlerRegistry> {
        let mut registry = StageHandlerRegistry::new();
        registry.register("echo", Box::new(|| Box::new(EchoStage) as Box<dyn StageHandler>));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn echo_round_trip_through_a_real_stage() {
        let sessions = Arc::new(SessionTable::new());
        let stage_registry = StageRegistry::new(
            handler_registry(),
            Arc::new(AsyncPools::init(1, 1)),
            NodeRegistry::from_entries(&[]),
            Arc::new(RouteDispatcher::new_stub()),
            sessions.clone(),
            NodeId::new(protocol::ServiceId::Play, "play-1"),
            Arc::new(NodeConfig::default()),
        );

        let session_node_id = NodeId::new(protocol::ServiceId::Play, "play-1");
        let mut inbox = sessions.register_local(42, 1024);

        let handle = stage_registry
            .get_or_create("echo", 1, Some(Packet::request("Create", 0, 1, vec![])))
            .unwrap();

        handle.deliver_client_packet(
            Packet::request("Authenticate", 1, 1, vec![]),
            42,
            session_node_id.clone(),
            true,
        );

        // Give the dispatcher a moment to process creation + join.
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.deliver_client_packet(
            Packet::request("Echo", 7, 1, b"hi".to_vec()),
            42,
            session_node_id,
            false,
        );

        let reply = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg_seq, 7);
        assert_eq!(reply.payload, b"hi".to_vec());
    }

    #[tokio::test]
    async fn dispatch_before_join_is_rejected() {
        let sessions = Arc::new(SessionTable::new());
        let stage_registry = StageRegistry::new(
            handler_registry(),
            Arc::new(AsyncPools::init(1, 1)),
            NodeRegistry::from_entries(&[]),
            Arc::new(RouteDispatcher::new_stub()),
            sessions.clone(),
            NodeId::new(protocol::ServiceId::Play, "play-1"),
            Arc::new(NodeConfig::default()),
        );
        let session_node_id = NodeId::new(protocol::ServiceId::Play, "play-1");
        let mut inbox = sessions.register_local(7, 1024);

        let handle = stage_registry
            .get_or_create("echo", 2, Some(Packet::request("Create", 0, 2, vec![])))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.deliver_client_packet(Packet::request("Echo", 3, 2, vec![]), 7, session_node_id, false);

        let reply = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.error_code, protocol::ErrorCode::NotAuthenticated.code());
    }
}
