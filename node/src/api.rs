//! API handler runtime (C9): the stateless counterpart to C6. An API node
//! runs no stages and keeps no actor state; every inbound request for a
//! registered `msgId` is handed to its `ApiHandler` on its own spawned
//! task, with no per-`msgId` single-thread guarantee the way a Stage
//! serializes its own traffic.

use std::sync::Arc;

use log::warn;
use protocol::{NodeId, Packet, RoutePacket, ServiceId};
use serde::{Deserialize, Serialize};

use crate::contracts::PacketView;
use crate::error::{NodeError, Result};
use crate::handler::ApiHandlerRegistry;
use crate::mesh::RouteDispatcher;
use crate::registry::{NodeRegistry, SelectionPolicy};
use crate::session::SessionTable;
use crate::stage::CREATE_STAGE_MSG_ID;

/// Body of the cross-node `CreateStage` RPC (§4.9), `postcard`-encoded
/// into a route packet's payload under the reserved
/// [`CREATE_STAGE_MSG_ID`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStageRequest {
    pub stage_type: String,
    pub stage_id: i64,
    pub payload: Vec<u8>,
}

/// Where an `ApiLink::reply` ends up: back over the mesh to the node that
/// issued a cross-node request, or straight at a client session this
/// node's own C3 listener accepted.
#[derive(Clone)]
enum ReplyTarget {
    RemoteNode { from: NodeId, msg_seq: u16 },
    Session { session_id: i64 },
}

/// Handle an `ApiHandler` uses to reach back into the framework: reply to
/// the caller, reach a client session, or ask a Play node to create a
/// stage.
#[derive(Clone)]
pub struct ApiLink {
    self_node_id: NodeId,
    msg_id: String,
    stage_id: i64,
    route_dispatcher: Arc<RouteDispatcher>,
    registry: NodeRegistry,
    sessions: Arc<SessionTable>,
    target: ReplyTarget,
}

impl ApiLink {
    /// Replies to the inbound request, wherever it came from. A no-op for
    /// pushes (`msgSeq == 0`), matching the client-wire contract.
    pub fn reply(&self, packet: Packet) {
        match &self.target {
            ReplyTarget::RemoteNode { from, msg_seq } => {
                if *msg_seq == 0 {
                    return;
                }
                self.route_dispatcher.send_push_to_node(
                    self.self_node_id.clone(),
                    from.clone(),
                    ServiceId::Api,
                    String::new(),
                    None,
                    None,
                    packet,
                );
            }
            ReplyTarget::Session { session_id } => {
                self.sessions.push(*session_id, packet);
            }
        }
    }

    /// Convenience for replying with just an error code and no payload.
    pub fn reply_error(&self, error_code: protocol::ErrorCode) {
        self.reply(Packet::reply(self.msg_id.clone(), self.request_msg_seq(), self.stage_id, error_code.code(), Vec::new()));
    }

    fn request_msg_seq(&self) -> u16 {
        match &self.target {
            ReplyTarget::RemoteNode { msg_seq, .. } => *msg_seq,
            ReplyTarget::Session { .. } => 0,
        }
    }

    /// Sends a packet directly at a client session, bypassing any stage.
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

    /// Asks `play_node_id` to create a stage of `stage_type`/`stage_id`,
    /// returning `OnCreate`'s reply packet once the Play node resolves it.
    pub async fn create_stage(
        &self,
        play_node_id: &NodeId,
        stage_type: impl Into<String>,
        stage_id: i64,
        payload: Vec<u8>,
    ) -> Result<Packet> {
        let request = CreateStageRequest { stage_type: stage_type.into(), stage_id, payload };
        let body = postcard::to_stdvec(&request).map_err(|e| NodeError::Internal(e.to_string()))?;
        let packet = Packet::request(CREATE_STAGE_MSG_ID, 0, stage_id, body);
        self.route_dispatcher
            .send_request(play_node_id.clone(), self.self_node_id.clone(), packet, String::new())
            .await
    }

    /// Like [`ApiLink::create_stage`], but treats `StageAlreadyExists` as
    /// success rather than an error.
    pub async fn get_or_create_stage(
        &self,
        play_node_id: &NodeId,
        stage_type: impl Into<String>,
        stage_id: i64,
        payload: Vec<u8>,
    ) -> Result<Packet> {
        match self.create_stage(play_node_id, stage_type, stage_id, payload).await {
            Ok(reply) if reply.error_code == protocol::ErrorCode::StageAlreadyExists.code() => Ok(reply),
            other => other,
        }
    }

    pub async fn request_to_api_service(
        &self,
        service_id: ServiceId,
        packet: Packet,
        policy: SelectionPolicy,
    ) -> Result<Packet> {
        let target = self.registry.select(service_id, &policy)?;
        self.route_dispatcher
            .send_request(target, self.self_node_id.clone(), packet, String::new())
            .await
    }
}

/// Runs registered `ApiHandler`s against inbound requests, whether they
/// arrived as a cross-node `RoutePacket` (via C5) or straight off a
/// client session this node's own C3 listener accepted.
pub struct ApiRuntime {
    handlers: Arc<ApiHandlerRegistry>,
    route_dispatcher: Arc<RouteDispatcher>,
    registry: NodeRegistry,
    sessions: Arc<SessionTable>,
    self_node_id: NodeId,
}

impl ApiRuntime {
    #[must_use]
    pub fn new(
        handlers: Arc<ApiHandlerRegistry>,
        route_dispatcher: Arc<RouteDispatcher>,
        registry: NodeRegistry,
        sessions: Arc<SessionTable>,
        self_node_id: NodeId,
    ) -> Self {
        Self { handlers, route_dispatcher, registry, sessions, self_node_id }
    }

    fn link_for(&self, msg_id: String, stage_id: i64, target: ReplyTarget) -> ApiLink {
        ApiLink {
            self_node_id: self.self_node_id.clone(),
            msg_id,
            stage_id,
            route_dispatcher: self.route_dispatcher.clone(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            target,
        }
    }

    /// Inter-node path: C5 classified `route` as destined for this node's
    /// API service.
    pub fn deliver(&self, route: RoutePacket) {
        let from = route.from.clone();
        let msg_seq = route.msg_seq;
        let msg_id = route.msg_id.clone();
        let stage_id = route.stage_id;
        let packet = route.into_packet();

        let Some(handler) = self.handlers.get(&msg_id) else {
            warn!("no API handler registered for msgId {msg_id:?}");
            if msg_seq != 0 {
                self.route_dispatcher.send_push_to_node(
                    self.self_node_id.clone(),
                    from,
                    ServiceId::Api,
                    String::new(),
                    None,
                    None,
                    Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::HandlerNotFound.code(), Vec::new()),
                );
            }
            return;
        };

        let link = self.link_for(msg_id, stage_id, ReplyTarget::RemoteNode { from, msg_seq });
        tokio::spawn(async move {
            handler.handle(PacketView::from_packet(packet), link).await;
        });
    }

    /// Local path: a client session on this API node sent `packet`
    /// directly (no stage is ever involved on an API node).
    pub fn dispatch_local(&self, packet: Packet, session_id: i64) {
        let msg_seq = packet.msg_seq;
        let msg_id = packet.msg_id.clone();
        let stage_id = packet.stage_id;

        let Some(handler) = self.handlers.get(&msg_id) else {
            if msg_seq != 0 {
                self.sessions.push(
                    session_id,
                    Packet::reply(msg_id, msg_seq, stage_id, protocol::ErrorCode::HandlerNotFound.code(), Vec::new()),
                );
            }
            return;
        };

        let link = self.link_for(msg_id, stage_id, ReplyTarget::Session { session_id });
        tokio::spawn(async move {
            handler.handle(PacketView::from_packet(packet), link).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ApiHandler;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoApi;

    #[async_trait]
    impl ApiHandler for EchoApi {
        async fn handle(&self, mut packet: PacketView, link: ApiLink) {
            let payload = packet.take_payload().unwrap_or_default();
            link.reply(Packet::reply(packet.msg_id().to_string(), packet.msg_seq(), packet.stage_id(), 0, payload));
        }
    }

    fn runtime_with_echo() -> (Arc<ApiRuntime>, Arc<SessionTable>) {
        let mut handlers = ApiHandlerRegistry::new();
        handlers.register("Echo", Arc::new(EchoApi));
        let sessions = Arc::new(SessionTable::new());
        let runtime = Arc::new(ApiRuntime::new(
            Arc::new(handlers),
            Arc::new(RouteDispatcher::new_stub()),
            NodeRegistry::from_entries(&[]),
            sessions.clone(),
            NodeId::new(ServiceId::Api, "api-1"),
        ));
        (runtime, sessions)
    }

    #[tokio::test]
    async fn dispatch_local_routes_to_registered_handler() {
        let (runtime, sessions) = runtime_with_echo();
        let mut inbox = sessions.register_local(1, 1024);
        runtime.dispatch_local(Packet::request("Echo", 5, 0, b"hi".to_vec()), 1);

        let reply = tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await.unwrap().unwrap();
        assert_eq!(reply.msg_seq, 5);
        assert_eq!(reply.payload, b"hi".to_vec());
    }

    #[tokio::test]
    async fn dispatch_local_replies_handler_not_found_for_unknown_msg_id() {
        let (runtime, sessions) = runtime_with_echo();
        let mut inbox = sessions.register_local(2, 1024);
        runtime.dispatch_local(Packet::request("Unknown", 9, 0, vec![]), 2);

        let reply = tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await.unwrap().unwrap();
        assert_eq!(reply.error_code, protocol::ErrorCode::HandlerNotFound.code());
    }
}
