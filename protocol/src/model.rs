//! Core wire data model: client [`Packet`]s and inter-node [`RoutePacket`]s.

use serde::{Deserialize, Serialize};

use crate::channel::ServiceId;

/// Maximum `Packet` body (everything after the length prefix) allowed on
/// the client wire.
pub const MAX_FRAME_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Maximum UTF-8 byte length of a `msgId`.
pub const MAX_MSG_ID_LEN: usize = u8::MAX as usize;

/// Identity of one node in the mesh: its service role plus a
/// deployment-assigned server id, unique within that service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub service_id: ServiceId,
    pub server_id: String,
}

impl NodeId {
    pub fn new(service_id: ServiceId, server_id: impl Into<String>) -> Self {
        Self {
            service_id,
            server_id: server_id.into(),
        }
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}:{}", self.service_id, self.server_id)
    }
}

/// A single client-wire packet. `msgSeq == 0` marks a push (server-initiated,
/// no reply expected); a non-zero `msgSeq` marks a request/reply pair.
/// Immutable once built — the payload is owned by the packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: i64,
    pub error_code: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a client-originated request (`error_code` is meaningless in
    /// this direction and defaults to zero).
    pub fn request(
        msg_id: impl Into<String>,
        msg_seq: u16,
        stage_id: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code: 0,
            payload,
        }
    }

    /// Builds a server push (`msgSeq = 0`, no caller to reply to).
    pub fn push(msg_id: impl Into<String>, stage_id: i64, payload: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq: 0,
            stage_id,
            error_code: 0,
            payload,
        }
    }

    /// Builds a reply to a previously received request, echoing its
    /// `msgSeq`.
    pub fn reply(
        msg_id: impl Into<String>,
        msg_seq: u16,
        stage_id: i64,
        error_code: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code,
            payload,
        }
    }

    #[must_use]
    pub const fn is_push(&self) -> bool {
        self.msg_seq == 0
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Envelope carrying a [`Packet`] plus routing metadata between nodes.
/// `session_node_id`/`session_id` are present only when the route is
/// steering a reply or push back to a specific client session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePacket {
    pub from: NodeId,
    pub msg_seq: u16,
    pub service_id: ServiceId,
    pub msg_id: String,
    pub error_code: u16,
    pub stage_id: i64,
    pub account_id: String,
    pub session_node_id: Option<NodeId>,
    pub session_id: Option<i64>,
    pub payload: Vec<u8>,
}

impl RoutePacket {
    /// Wraps a client [`Packet`] for transit across the node mesh.
    pub fn from_packet(
        from: NodeId,
        service_id: ServiceId,
        account_id: impl Into<String>,
        session_node_id: Option<NodeId>,
        session_id: Option<i64>,
        packet: Packet,
    ) -> Self {
        Self {
            from,
            msg_seq: packet.msg_seq,
            service_id,
            msg_id: packet.msg_id,
            error_code: packet.error_code,
            stage_id: packet.stage_id,
            account_id: account_id.into(),
            session_node_id,
            session_id,
            payload: packet.payload,
        }
    }

    /// Recovers the client-facing [`Packet`] carried by this envelope.
    #[must_use]
    pub fn into_packet(self) -> Packet {
        Packet {
            msg_id: self.msg_id,
            msg_seq: self.msg_seq,
            stage_id: self.stage_id,
            error_code: self.error_code,
            payload: self.payload,
        }
    }

    #[must_use]
    pub const fn is_push(&self) -> bool {
        self.msg_seq == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(service_id: ServiceId, server_id: &str) -> NodeId {
        NodeId::new(service_id, server_id)
    }

    #[test]
    fn push_constructor_sets_msg_seq_zero() {
        let p = Packet::push("Broadcast", 42, b"hi".to_vec());
        assert!(p.is_push());
        assert_eq!(p.stage_id, 42);
    }

    #[test]
    fn request_then_reply_preserve_msg_seq() {
        let req = Packet::request("Echo", 7, 1, b"hi".to_vec());
        let rep = Packet::reply("Echo", req.msg_seq, req.stage_id, 0, b"hi".to_vec());
        assert_eq!(req.msg_seq, rep.msg_seq);
        assert!(rep.is_success());
    }

    #[test]
    fn route_packet_round_trips_into_packet() {
        let from = node(ServiceId::Play, "play-1");
        let packet = Packet::request("Echo", 7, 1, b"hi".to_vec());
        let route =
            RoutePacket::from_packet(from, ServiceId::Play, "u1", None, None, packet.clone());
        assert_eq!(route.into_packet(), packet);
    }
}
