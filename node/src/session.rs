//! Session endpoint (C2): the per-connection state machine that sits
//! between a C3 transport listener and the C6 stage dispatcher. Owns the
//! authentication gate, the client-facing request/reply bookkeeping, and
//! the heartbeat/close-grace lifecycle described in SPEC_FULL.md §4.2.
//!
//! `SessionTable` is the process-wide directory every other module reaches
//! into (via `Arc<SessionTable>`) to push a packet at a session by id
//! without knowing which transport it arrived on — the same role the
//! session manager's `DashMap<String, SessionData>` plays for the login
//! server, just keyed by a numeric session id instead of a token.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, info, warn};
use protocol::{ErrorCode, Packet, TransportKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::config::NodeConfig;
use crate::stage::StageRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

struct SessionEntry {
    outbound: mpsc::UnboundedSender<Packet>,
    state: std::sync::Mutex<SessionState>,
    close_reason: std::sync::Mutex<Option<ErrorCode>>,
    notify: Notify,
    pending_client_requests: DashMap<u16, oneshot::Sender<Packet>>,
    max_pending_client_requests: usize,
}

/// Directory of every session endpoint live on this node, keyed by session
/// id. The framework's only route to a specific client connection.
pub struct SessionTable {
    entries: DashMap<i64, Arc<SessionEntry>>,
    next_id: AtomicI64,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Allocates a fresh, process-unique session id.
    #[must_use]
    pub fn next_session_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a new session endpoint in `Open` state and returns the
    /// receiver its connection task should drain for outbound traffic.
    /// `max_pending_client_requests` bounds how many server-initiated
    /// requests (`ActorLink::request`) may be outstanding on this session
    /// at once, per SPEC_FULL.md §3's "max in-flight requests" invariant.
    #[must_use]
    pub fn register_local(&self, session_id: i64, max_pending_client_requests: usize) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(
            session_id,
            Arc::new(SessionEntry {
                outbound: tx,
                state: std::sync::Mutex::new(SessionState::Open),
                close_reason: std::sync::Mutex::new(None),
                notify: Notify::new(),
                pending_client_requests: DashMap::new(),
                max_pending_client_requests,
            }),
        );
        rx
    }

    /// Pushes a server-originated packet (reply or push) at a session.
    /// Silently dropped if the session no longer exists.
    pub fn push(&self, session_id: i64, packet: Packet) {
        if let Some(entry) = self.entries.get(&session_id) {
            let _ = entry.outbound.send(packet);
        }
    }

    /// Marks a session `Authenticated` and wakes anyone waiting on the
    /// join gate (normally its own connection task).
    pub fn mark_authenticated(&self, session_id: i64, _stage_type: String) {
        if let Some(entry) = self.entries.get(&session_id) {
            *entry.state.lock().expect("session mutex poisoned") = SessionState::Authenticated;
            entry.notify.notify_waiters();
        }
    }

    /// Clears the authenticated binding, e.g. when the actor it was
    /// attached to leaves its stage. Schedules the session for a graceful
    /// close since a session with no actor has nothing left to serve.
    pub fn clear_authenticated(&self, session_id: i64) {
        self.request_close(session_id, ErrorCode::Success);
    }

    #[must_use]
    pub fn is_authenticated(&self, session_id: i64) -> bool {
        self.entries
            .get(&session_id)
            .map(|e| *e.state.lock().expect("session mutex poisoned") == SessionState::Authenticated)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn state(&self, session_id: i64) -> Option<SessionState> {
        self.entries
            .get(&session_id)
            .map(|e| *e.state.lock().expect("session mutex poisoned"))
    }

    /// Registers a pending server-initiated request (`ActorLink::request`)
    /// awaiting the client's reply, correlated by `msgSeq`. Rejects the
    /// request with `false` once the session's configured in-flight cap is
    /// reached, per SPEC_FULL.md §3; the caller does not enqueue `tx`.
    #[must_use]
    pub fn register_client_request(&self, session_id: i64, msg_seq: u16, tx: oneshot::Sender<Packet>) -> bool {
        if let Some(entry) = self.entries.get(&session_id) {
            if entry.pending_client_requests.len() >= entry.max_pending_client_requests {
                return false;
            }
            entry.pending_client_requests.insert(msg_seq, tx);
            true
        } else {
            false
        }
    }

    /// Takes the pending request matching `msg_seq`, if any. Called by the
    /// session's read loop before treating an inbound packet as an
    /// ordinary client request.
    #[must_use]
    pub fn take_pending_client_request(&self, session_id: i64, msg_seq: u16) -> Option<oneshot::Sender<Packet>> {
        self.entries
            .get(&session_id)
            .and_then(|e| e.pending_client_requests.remove(&msg_seq))
            .map(|(_, tx)| tx)
    }

    /// Requests that a session close itself once its connection task next
    /// observes this state. `reason` is informational only when it is
    /// `Success` (a routine teardown, not a protocol failure).
    pub fn request_close(&self, session_id: i64, reason: ErrorCode) {
        if let Some(entry) = self.entries.get(&session_id) {
            let mut state = entry.state.lock().expect("session mutex poisoned");
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closing;
            *entry.close_reason.lock().expect("session mutex poisoned") = Some(reason);
            entry.notify.notify_waiters();
        }
    }

    /// Consumes the close reason set by `request_close`, if any. Returns
    /// `None` if no close has been requested.
    #[must_use]
    fn take_close_reason(&self, session_id: i64) -> Option<ErrorCode> {
        self.entries
            .get(&session_id)
            .and_then(|e| e.close_reason.lock().expect("session mutex poisoned").take())
    }

    fn notify_handle(&self, session_id: i64) -> Option<Arc<SessionEntry>> {
        self.entries.get(&session_id).map(|e| e.clone())
    }

    /// Removes a session entirely. Called once its connection task exits.
    pub fn unregister(&self, session_id: i64) {
        self.entries.remove(&session_id);
    }
}

/// Which half of the framework a session's inbound traffic is dispatched
/// to. A Play node gates traffic behind authentication and a stage join;
/// an API node has no stages or actors, so every packet goes straight to
/// [`crate::api::ApiRuntime::dispatch_local`] by `msgId`.
#[derive(Clone)]
pub enum SessionRole {
    Play(Arc<StageRegistry>),
    Api(Arc<crate::api::ApiRuntime>),
}

/// Shared context every session endpoint needs, regardless of which C3
/// transport accepted its connection.
pub struct SessionContext {
    pub sessions: Arc<SessionTable>,
    pub role: SessionRole,
    pub config: Arc<NodeConfig>,
}

/// Drives one client connection end to end: decodes inbound frames,
/// enforces the authentication gate, forwards post-join traffic to the
/// owning stage, and writes back whatever the stage (or the gate itself)
/// pushes onto this session. Generic over the byte stream so TCP, TLS and
/// WebSocket listeners can all hand it the same loop.
pub async fn run_session<R, W>(mut reader: R, mut writer: W, transport_kind: TransportKind, ctx: Arc<SessionContext>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let session_id = ctx.sessions.next_session_id();
    let mut outbound = ctx
        .sessions
        .register_local(session_id, ctx.config.limits.max_pending_requests_per_session);
    let Some(entry) = ctx.sessions.notify_handle(session_id) else {
        return;
    };
    info!("session {session_id} opened over {transport_kind}");

    let mut read_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];
    let mut pending_queue: VecDeque<Packet> = VecDeque::new();
    let mut local_state = SessionState::Open;
    let mut bound_stage: Option<(String, i64)> = None;
    let mut last_activity = Instant::now();

    let heartbeat_interval = ctx.config.timeouts.heartbeat_interval();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'connection: loop {
        tokio::select! {
            biased;

            maybe_packet = outbound.recv() => {
                let Some(packet) = maybe_packet else { break 'connection };
                if is_auth_failure_reply(&packet, local_state, &ctx) {
                    let _ = write_frame(&mut writer, &packet).await;
                    ctx.sessions.request_close(session_id, ErrorCode::AuthenticationFailed);
                } else if write_frame(&mut writer, &packet).await.is_err() {
                    break 'connection;
                }
            }

            () = entry.notify.notified() => {
                if local_state == SessionState::Authenticating && ctx.sessions.is_authenticated(session_id) {
                    local_state = SessionState::Authenticated;
                    if let SessionRole::Play(stage_registry) = &ctx.role {
                        while let Some(queued) = pending_queue.pop_front() {
                            dispatch_post_join(&queued, session_id, &bound_stage, stage_registry, &ctx.sessions);
                        }
                    }
                }
            }

            read_result = reader.read(&mut chunk) => {
                match read_result {
                    Ok(0) => break 'connection,
                    Err(_) => break 'connection,
                    Ok(n) => {
                        last_activity = Instant::now();
                        read_buf.extend_from_slice(&chunk[..n]);
                        loop {
                            match protocol::codec::try_decode_request_frame(&read_buf) {
                                Ok(Some((packet, consumed))) => {
                                    read_buf.drain(..consumed);
                                    if !handle_inbound_packet(
                                        packet,
                                        session_id,
                                        &mut writer,
                                        &mut local_state,
                                        &mut bound_stage,
                                        &mut pending_queue,
                                        &ctx,
                                    ).await {
                                        break 'connection;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("session {session_id} sent a malformed frame: {e}");
                                    break 'connection;
                                }
                            }
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= heartbeat_interval.saturating_mul(2) {
                    debug!("session {session_id} timed out waiting for client activity");
                    ctx.sessions.request_close(session_id, ErrorCode::RequestTimeout);
                }
            }
        }

        if let Some(reason) = ctx.sessions.take_close_reason(session_id) {
            if !reason.is_success() {
                let close_notice = Packet::push("Close", 0, reason.code().to_le_bytes().to_vec());
                let _ = write_frame(&mut writer, &close_notice).await;
            }
            tokio::time::sleep(ctx.config.timeouts.session_close_grace()).await;
            break;
        }
    }

    if local_state == SessionState::Authenticated {
        if let SessionRole::Play(stage_registry) = &ctx.role {
            if let Some((stage_type, stage_id)) = &bound_stage {
                if let Some(handle) = stage_registry.lookup(stage_type, *stage_id) {
                    handle.actor_disconnected(session_id);
                }
            }
        }
    }
    ctx.sessions.unregister(session_id);
    info!("session {session_id} closed");
}

/// Detects the one reply that signals the authentication gate resolved to
/// failure: the reply to the configured `authenticateMessageId` carrying a
/// non-zero `errorCode`, seen while still `Authenticating`.
fn is_auth_failure_reply(packet: &Packet, state: SessionState, ctx: &SessionContext) -> bool {
    state == SessionState::Authenticating
        && packet.msg_id == ctx.config.authenticate_message_id
        && packet.error_code != 0
}

async fn handle_inbound_packet<W>(
    packet: Packet,
    session_id: i64,
    writer: &mut W,
    state: &mut SessionState,
    bound_stage: &mut Option<(String, i64)>,
    pending_queue: &mut VecDeque<Packet>,
    ctx: &Arc<SessionContext>,
) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    if !packet.is_push() {
        if let Some(tx) = ctx.sessions.take_pending_client_request(session_id, packet.msg_seq) {
            let _ = tx.send(packet);
            return true;
        }
    }

    let stage_registry = match &ctx.role {
        SessionRole::Api(api_runtime) => {
            api_runtime.dispatch_local(packet, session_id);
            return true;
        }
        SessionRole::Play(stage_registry) => stage_registry,
    };

    match *state {
        SessionState::Open => {
            if packet.msg_id != ctx.config.authenticate_message_id {
                let reply = Packet::reply(
                    packet.msg_id,
                    packet.msg_seq,
                    packet.stage_id,
                    ErrorCode::NotAuthenticated.code(),
                    Vec::new(),
                );
                let _ = write_frame(writer, &reply).await;
                ctx.sessions.request_close(session_id, ErrorCode::NotAuthenticated);
                return true;
            }

            let Some(stage_type) = stage_registry.resolve_default_stage_type() else {
                let reply = Packet::reply(
                    packet.msg_id,
                    packet.msg_seq,
                    packet.stage_id,
                    ErrorCode::InvalidStageType.code(),
                    Vec::new(),
                );
                let _ = write_frame(writer, &reply).await;
                ctx.sessions.request_close(session_id, ErrorCode::InvalidStageType);
                return true;
            };

            let stage_id = packet.stage_id;
            let self_node_id = stage_registry.self_node_id().clone();
            match stage_registry.get_or_create(&stage_type, stage_id, None) {
                Ok(handle) => {
                    handle.deliver_client_packet(packet, session_id, self_node_id, true);
                    *bound_stage = Some((stage_type, stage_id));
                    *state = SessionState::Authenticating;
                }
                Err(e) => {
                    let reply = Packet::reply(
                        "Authenticate",
                        packet.msg_seq,
                        stage_id,
                        e.error_code().code(),
                        Vec::new(),
                    );
                    let _ = write_frame(writer, &reply).await;
                    ctx.sessions.request_close(session_id, e.error_code());
                    return true;
                }
            }
            true
        }

        SessionState::Authenticating => {
            pending_queue.push_back(packet);
            true
        }

        SessionState::Authenticated => {
            dispatch_post_join(&packet, session_id, bound_stage, stage_registry, &ctx.sessions);
            true
        }

        SessionState::Closing | SessionState::Closed => true,
    }
}

fn dispatch_post_join(
    packet: &Packet,
    session_id: i64,
    bound_stage: &Option<(String, i64)>,
    stage_registry: &Arc<StageRegistry>,
    sessions: &Arc<SessionTable>,
) {
    let Some((stage_type, stage_id)) = bound_stage else { return };
    let Some(handle) = stage_registry.lookup(stage_type, *stage_id) else {
        sessions.push(
            session_id,
            Packet::reply(packet.msg_id.clone(), packet.msg_seq, packet.stage_id, ErrorCode::StageNotFound.code(), Vec::new()),
        );
        return;
    };
    let self_node_id = stage_registry.self_node_id().clone();
    handle.deliver_client_packet(packet.clone(), session_id, self_node_id, false);
}

async fn write_frame<W>(writer: &mut W, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let frame = protocol::codec::encode_reply_frame(packet)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_push_delivers_to_outbox() {
        let table = SessionTable::new();
        let mut rx = table.register_local(1, 1024);
        table.push(1, Packet::push("Hello", 0, vec![1, 2, 3]));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.payload, vec![1, 2, 3]);
    }

    #[test]
    fn mark_authenticated_flips_state() {
        let table = SessionTable::new();
        let _rx = table.register_local(1, 1024);
        assert!(!table.is_authenticated(1));
        table.mark_authenticated(1, "room".to_string());
        assert!(table.is_authenticated(1));
    }

    #[test]
    fn pending_client_request_round_trips() {
        let table = SessionTable::new();
        let _rx = table.register_local(1, 1024);
        let (tx, mut oneshot_rx) = oneshot::channel();
        assert!(table.register_client_request(1, 7, tx));
        let taken = table.take_pending_client_request(1, 7).unwrap();
        taken.send(Packet::reply("Ping", 7, 0, 0, vec![])).unwrap();
        assert_eq!(oneshot_rx.try_recv().unwrap().msg_seq, 7);
    }

    #[test]
    fn pending_client_request_cap_rejects_beyond_limit() {
        let table = SessionTable::new();
        let _rx = table.register_local(1, 2);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        assert!(table.register_client_request(1, 1, tx1));
        assert!(table.register_client_request(1, 2, tx2));
        assert!(!table.register_client_request(1, 3, tx3));

        assert!(table.take_pending_client_request(1, 1).is_some());
        let (tx4, _rx4) = oneshot::channel();
        assert!(table.register_client_request(1, 4, tx4));
    }

    #[test]
    fn unknown_session_operations_are_no_ops() {
        let table = SessionTable::new();
        table.push(99, Packet::push("X", 0, vec![]));
        table.mark_authenticated(99, "room".to_string());
        table.clear_authenticated(99);
        assert!(table.take_pending_client_request(99, 1).is_none());
    }

    #[test]
    fn request_close_sets_reason_once() {
        let table = SessionTable::new();
        let _rx = table.register_local(1, 1024);
        table.request_close(1, ErrorCode::NotAuthenticated);
        assert_eq!(table.state(1), Some(SessionState::Closing));
        assert_eq!(table.take_close_reason(1), Some(ErrorCode::NotAuthenticated));
        assert_eq!(table.take_close_reason(1), None);
    }
}
