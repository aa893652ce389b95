//! Node mesh transport (C4) and route dispatcher (C5), combined in one
//! module, covering connection setup, TLS material, and the accept loop
//! together.
//!
//! C4 owns the QUIC pipes between nodes (connect-on-demand, bounded send
//! queue, capped backoff). C5 sits on top: it allocates `msgSeq`s for
//! outbound requests, correlates replies against the pending-request
//! table, and classifies inbound route packets to the Stage dispatcher or
//! the API handler runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use protocol::{NodeId, Packet, RoutePacket, ServiceId};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::api::ApiRuntime;
use crate::error::{NodeError, Result};
use crate::registry::NodeRegistry;
use crate::session::SessionTable;
use crate::stage::StageRegistry;
use crate::tls_util::TlsMaterial;

/// Outbound frame queued for a specific peer: a target-node marker plus
/// the already-`postcard`-encoded route header/payload blob.
struct OutboundFrame {
    bytes: Vec<u8>,
}

struct PeerPipe {
    tx: mpsc::Sender<OutboundFrame>,
}

/// ROUTER-style node-to-node transport over QUIC. Each peer gets one
/// cached, reused connection; frames are exchanged one per bidirectional
/// stream per SPEC_FULL.md §4.4.
pub struct MeshTransport {
    self_node_id: NodeId,
    endpoint: Endpoint,
    registry: NodeRegistry,
    send_queue_size: usize,
    pipes: DashMap<NodeId, PeerPipe>,
    inbound_tx: mpsc::UnboundedSender<RoutePacket>,
}

impl MeshTransport {
    /// Binds the local mesh endpoint and starts the accept loop. `inbound`
    /// is handed every frame this node receives from a peer.
    pub async fn bind(
        self_node_id: NodeId,
        bind_addr: std::net::SocketAddr,
        tls: &TlsMaterial,
        registry: NodeRegistry,
        send_queue_size: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RoutePacket>)> {
        let server_config = ServerConfig::with_single_cert(tls.cert_chain(), tls.key())
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let mut endpoint =
            Endpoint::server(server_config, bind_addr).map_err(NodeError::Io)?;
        endpoint.set_default_client_config(client_config(tls)?);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(Self {
            self_node_id,
            endpoint: endpoint.clone(),
            registry,
            send_queue_size,
            pipes: DashMap::new(),
            inbound_tx,
        });

        let accept_mesh = mesh.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_mesh.endpoint.accept().await {
                let mesh = accept_mesh.clone();
                tokio::spawn(async move {
                    if let Ok(conn) = incoming.await {
                        mesh.handle_incoming_connection(conn).await;
                    }
                });
            }
        });

        Ok((mesh, inbound_rx))
    }

    async fn handle_incoming_connection(&self, conn: quinn::Connection) {
        loop {
            match conn.accept_bi().await {
                Ok((_send, mut recv)) => {
                    let inbound_tx = self.inbound_tx.clone();
                    tokio::spawn(async move {
                        if let Ok(bytes) = recv.read_to_end(16 * 1024 * 1024).await {
                            match protocol::decode_route_packet(&bytes) {
                                Ok(route_packet) => {
                                    let _ = inbound_tx.send(route_packet);
                                }
                                Err(e) => warn!("dropping malformed route frame: {e}"),
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    }

    /// Enqueues `route_packet` for `target`. Connects lazily if no pipe
    /// exists yet. Never blocks the caller; returns `SendQueueFull` if the
    /// peer's outbound queue is saturated.
    pub fn send(&self, target: &NodeId, route_packet: &RoutePacket) -> Result<()> {
        let bytes =
            protocol::encode_route_packet(route_packet).map_err(NodeError::Codec)?;
        let frame = OutboundFrame { bytes };

        let pipe_exists = self.pipes.contains_key(target);
        if !pipe_exists {
            self.spawn_pipe(target.clone());
        }

        let Some(pipe) = self.pipes.get(target) else {
            return Err(NodeError::ServerNotFound(target.to_string()));
        };
        pipe.tx
            .try_send(frame)
            .map_err(|_| NodeError::SendQueueFull)
    }

    fn spawn_pipe(&self, target: NodeId) {
        let (tx, rx) = mpsc::channel(self.send_queue_size);
        match self.pipes.entry(target.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(PeerPipe { tx });
            }
        }

        let endpoint = self.endpoint.clone();
        let registry = self.registry.clone();
        tokio::spawn(pipe_worker(endpoint, target, registry, rx));
    }
}

/// Drains queued frames for one peer, (re)connecting with capped
/// exponential backoff on demand.
async fn pipe_worker(
    endpoint: Endpoint,
    target: NodeId,
    registry: NodeRegistry,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
    const MAX_BACKOFF: Duration = Duration::from_secs(5);

    let mut backoff = INITIAL_BACKOFF;
    let mut conn: Option<quinn::Connection> = None;

    while let Some(frame) = rx.recv().await {
        loop {
            if conn.is_none() {
                let Some(endpoint_str) = registry.endpoint_for(&target) else {
                    warn!("no registry endpoint for {target}, dropping frame");
                    break;
                };
                match connect(&endpoint, &endpoint_str).await {
                    Ok(c) => {
                        conn = Some(c);
                        backoff = INITIAL_BACKOFF;
                    }
                    Err(e) => {
                        debug!("mesh connect to {target} failed: {e}, backing off {backoff:?}");
                        registry.record_send_result(&target, false);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }

            let Some(active) = conn.as_ref() else { continue };
            match send_one_frame(active, &frame.bytes).await {
                Ok(()) => {
                    registry.record_send_result(&target, true);
                    break;
                }
                Err(_) => {
                    registry.record_send_result(&target, false);
                    conn = None;
                }
            }
        }
    }
}

async fn connect(endpoint: &Endpoint, addr_str: &str) -> Result<quinn::Connection> {
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|_| NodeError::Config(format!("invalid mesh endpoint {addr_str}")))?;
    endpoint
        .connect(addr, "playhouse-mesh")
        .map_err(|e| NodeError::Internal(e.to_string()))?
        .await
        .map_err(|e| NodeError::Internal(e.to_string()))
}

async fn send_one_frame(conn: &quinn::Connection, bytes: &[u8]) -> Result<()> {
    let (mut send, _recv) = conn
        .open_bi()
        .await
        .map_err(|e| NodeError::Internal(e.to_string()))?;
    send.write_all(bytes).await.map_err(|e| NodeError::Internal(e.to_string()))?;
    send.finish().map_err(|e| NodeError::Internal(e.to_string()))?;
    Ok(())
}

fn client_config(tls: &TlsMaterial) -> Result<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in tls.cert_chain() {
        roots
            .add(cert.clone())
            .map_err(|e| NodeError::Config(e.to_string()))?;
    }
    let crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| NodeError::Config(e.to_string()))?,
    )))
}

struct PendingEntry {
    reply_tx: oneshot::Sender<RoutePacket>,
}

/// Route dispatcher (C5): allocates outbound `msgSeq`s, owns the
/// pending-request table, and classifies inbound traffic.
pub struct RouteDispatcher {
    self_node_id: NodeId,
    transport: Option<Arc<MeshTransport>>,
    registry: NodeRegistry,
    next_seq: AtomicU16,
    pending: DashMap<u16, PendingEntry>,
    default_timeout: Duration,
    stage_registry: OnceLock<Arc<StageRegistry>>,
    api_runtime: OnceLock<Arc<ApiRuntime>>,
    sessions: OnceLock<Arc<SessionTable>>,
    correlation_misses: AtomicU64,
}

impl RouteDispatcher {
    #[must_use]
    pub fn new(
        self_node_id: NodeId,
        transport: Arc<MeshTransport>,
        registry: NodeRegistry,
        default_timeout: Duration,
    ) -> Self {
        Self {
            self_node_id,
            transport: Some(transport),
            registry,
            next_seq: AtomicU16::new(1),
            pending: DashMap::new(),
            default_timeout,
            stage_registry: OnceLock::new(),
            api_runtime: OnceLock::new(),
            sessions: OnceLock::new(),
            correlation_misses: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn new_stub() -> Self {
        Self {
            self_node_id: NodeId::new(ServiceId::Play, "stub"),
            transport: None,
            registry: NodeRegistry::from_entries(&[]),
            next_seq: AtomicU16::new(1),
            pending: DashMap::new(),
            default_timeout: Duration::from_secs(30),
            stage_registry: OnceLock::new(),
            api_runtime: OnceLock::new(),
            sessions: OnceLock::new(),
            correlation_misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn self_node_id(&self) -> &NodeId {
        &self.self_node_id
    }

    pub fn attach_play(&self, stage_registry: Arc<StageRegistry>) {
        let _ = self.stage_registry.set(stage_registry);
    }

    pub fn attach_api(&self, api_runtime: Arc<ApiRuntime>) {
        let _ = self.api_runtime.set(api_runtime);
    }

    pub fn attach_sessions(&self, sessions: Arc<SessionTable>) {
        let _ = self.sessions.set(sessions);
    }

    fn allocate_seq(&self) -> u16 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq == 0 {
                continue;
            }
            if let Entry::Vacant(_) = self.pending.entry(seq) {
                return seq;
            }
        }
    }

    /// `sendRequest`: allocates a free `msgSeq`, registers the pending
    /// entry, and enqueues the frame. Resolves with the reply or
    /// `RequestTimeout`.
    pub async fn send_request(
        &self,
        target: NodeId,
        from: NodeId,
        packet: Packet,
        account_id: String,
    ) -> Result<Packet> {
        self.send_request_with_timeout(target, from, packet, account_id, self.default_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        target: NodeId,
        from: NodeId,
        mut packet: Packet,
        account_id: String,
        timeout: Duration,
    ) -> Result<Packet> {
        let seq = self.allocate_seq();
        packet.msg_seq = seq;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, PendingEntry { reply_tx: tx });

        let route = RoutePacket::from_packet(
            from,
            target.service_id,
            account_id,
            None,
            None,
            packet,
        );

        if let Err(e) = self.dispatch_outbound(&target, &route) {
            self.pending.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply.into_packet()),
            Ok(Err(_)) => Err(NodeError::StageClosed),
            Err(_) => {
                self.pending.remove(&seq);
                Err(NodeError::RequestTimeout)
            }
        }
    }

    /// `send`: fire-and-forget, `msgSeq = 0`, no correlation tracked.
    pub fn send(&self, target: NodeId, from: NodeId, mut packet: Packet, account_id: String) {
        packet.msg_seq = 0;
        let route = RoutePacket::from_packet(from, target.service_id, account_id, None, None, packet);
        let _ = self.dispatch_outbound(&target, &route);
    }

    pub fn send_push_to_node(
        &self,
        from: NodeId,
        target: NodeId,
        service_id: ServiceId,
        account_id: String,
        session_node_id: Option<NodeId>,
        session_id: Option<i64>,
        packet: Packet,
    ) {
        let route = RoutePacket::from_packet(from, service_id, account_id, session_node_id, session_id, packet);
        let _ = self.dispatch_outbound(&target, &route);
    }

    /// `requestToStage`: local fast path if the stage already lives on
    /// this node; otherwise a best-effort round-robin to a Play peer
    /// (there is no stage-location directory — see DESIGN.md).
    pub async fn send_request_to_stage(
        &self,
        from: NodeId,
        target_stage_type: String,
        packet: Packet,
    ) -> Result<Packet> {
        if let Some(local) = self.stage_registry.get() {
            if let Some(handle) = local.lookup(&target_stage_type, packet.stage_id) {
                return handle.request(packet).await;
            }
        }
        let target = self
            .registry
            .select(ServiceId::Play, &crate::registry::SelectionPolicy::RoundRobin)?;
        self.send_request(target, from, packet, String::new()).await
    }

    fn dispatch_outbound(&self, target: &NodeId, route: &RoutePacket) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Err(NodeError::ServerNotFound(target.to_string()));
        };
        transport.send(target, route)
    }

    /// Inbound classification per §4.5: resolve a pending reply, or
    /// deliver to the Stage dispatcher / API handler runtime.
    pub fn deliver_inbound(&self, route: RoutePacket) {
        if route.msg_seq != 0 {
            if let Some((_, entry)) = self.pending.remove(&route.msg_seq) {
                let _ = entry.reply_tx.send(route);
                return;
            }
            if route.error_code != 0 {
                // A reply-shaped packet whose seq no longer has a pending
                // entry: already timed out, or a stale duplicate. Dropped
                // silently per §4.5's RouteCorrelationMissing handling.
                self.correlation_misses.fetch_add(1, Ordering::Relaxed);
                debug!("route correlation missing for msgSeq {}", route.msg_seq);
                return;
            }
        }

        if let Some(session_id) = route.session_id {
            if let Some(sessions) = self.sessions.get() {
                let packet = route.into_packet();
                sessions.push(session_id, packet);
                return;
            }
        }

        match route.service_id {
            ServiceId::Play => {
                if let Some(registry) = self.stage_registry.get() {
                    if route.msg_id == crate::stage::CREATE_STAGE_MSG_ID {
                        registry.handle_create_stage_route(route);
                    } else {
                        registry.deliver_remote(route);
                    }
                } else {
                    warn!("inbound Play-targeted route packet but no stage registry attached");
                }
            }
            ServiceId::Api => {
                if let Some(api) = self.api_runtime.get() {
                    api.deliver(route);
                } else {
                    warn!("inbound API-targeted route packet but no api runtime attached");
                }
            }
        }
    }

    /// Drains the inbound channel produced by `MeshTransport::bind`,
    /// classifying every frame. Runs for the lifetime of the node.
    pub fn spawn_inbound_loop(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<RoutePacket>,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(route) = inbound_rx.recv().await {
                dispatcher.deliver_inbound(route);
            }
        });
    }
}

/// Guards concurrent construction so `MeshTransport::bind` only binds the
/// process-wide QUIC endpoint once. Held by `node_runtime.rs`.
pub type BootstrapLock = AsyncMutex<()>;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Packet;

    #[tokio::test]
    async fn deliver_inbound_resolves_matching_pending_entry() {
        let dispatcher = RouteDispatcher::new_stub();
        let seq = dispatcher.allocate_seq();
        let (tx, rx) = oneshot::channel();
        dispatcher.pending.insert(seq, PendingEntry { reply_tx: tx });

        let from = NodeId::new(ServiceId::Api, "api-1");
        let reply = Packet::reply("Echo", seq, 1, 0, b"ok".to_vec());
        let route = RoutePacket::from_packet(from, ServiceId::Play, String::new(), None, None, reply);
        dispatcher.deliver_inbound(route);

        let resolved = rx.await.unwrap();
        assert_eq!(resolved.msg_seq, seq);
        assert_eq!(resolved.payload, b"ok".to_vec());
        assert!(!dispatcher.pending.contains_key(&seq));
    }

    #[tokio::test]
    async fn request_times_out_when_no_reply_arrives() {
        let dispatcher = RouteDispatcher::new_stub();
        let target = NodeId::new(ServiceId::Api, "api-ghost");
        let from = NodeId::new(ServiceId::Play, "stub");
        let packet = Packet::request("Echo", 0, 1, b"hi".to_vec());
        let result = dispatcher
            .send_request_with_timeout(target, from, packet, String::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(NodeError::RequestTimeout) | Err(NodeError::ServerNotFound(_))));
    }

    #[test]
    fn allocate_seq_never_returns_zero() {
        let dispatcher = RouteDispatcher::new_stub();
        for _ in 0..10 {
            assert_ne!(dispatcher.allocate_seq(), 0);
        }
    }
}
