//! Client frame codec and inter-node `RoutePacket` wire encoding.
//!
//! Client frame layout (all integers little-endian):
//! `[length: u32][msgIdLen: u8][msgId][msgSeq: u16][stageId: i64][payload]`.
//! The reply direction (server -> client) additionally carries
//! `[errorCode: u16][originalSize: u32]` right after `stageId`; `originalSize`
//! is reserved for optional compression and must be zero.

use crate::model::{Packet, RoutePacket, MAX_FRAME_BODY_BYTES, MAX_MSG_ID_LEN};

const LENGTH_PREFIX_LEN: usize = 4;
const MSG_ID_LEN_PREFIX_LEN: usize = 1;
const MSG_SEQ_LEN: usize = 2;
const STAGE_ID_LEN: usize = 8;
const ERROR_CODE_LEN: usize = 2;
const ORIGINAL_SIZE_LEN: usize = 4;

/// Errors produced while encoding/decoding client frames or route packets.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("frame declares body length {actual} which exceeds the {limit} byte limit")]
    OversizedFrame { limit: usize, actual: usize },

    #[error("frame is truncated: need at least {needed} bytes, have {have}")]
    TruncatedFrame { needed: usize, have: usize },

    #[error("msgId is not valid UTF-8")]
    InvalidUtf8MsgId(#[source] std::str::Utf8Error),

    #[error("msgId length {0} exceeds the {MAX_MSG_ID_LEN} byte limit")]
    MsgIdTooLong(usize),

    #[error(
        "reply frame declared a non-zero originalSize ({0}); compression is not supported"
    )]
    ReservedCompressionFlagSet(u32),

    #[error("route packet serialization error: {0}")]
    RouteSerialization(#[from] postcard::Error),
}

/// Encodes a client-originated request/push frame (client -> server
/// direction): no `errorCode`/`originalSize` fields.
pub fn encode_request_frame(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    encode_frame(packet, false)
}

/// Encodes a server-originated reply/push frame (server -> client
/// direction): always carries `errorCode` and a reserved zero
/// `originalSize`.
pub fn encode_reply_frame(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    encode_frame(packet, true)
}

fn encode_frame(packet: &Packet, reply_direction: bool) -> Result<Vec<u8>, CodecError> {
    if packet.msg_id.len() > MAX_MSG_ID_LEN {
        return Err(CodecError::MsgIdTooLong(packet.msg_id.len()));
    }

    let msg_id_bytes = packet.msg_id.as_bytes();
    let mut body_len = MSG_ID_LEN_PREFIX_LEN + msg_id_bytes.len() + MSG_SEQ_LEN + STAGE_ID_LEN;
    if reply_direction {
        body_len += ERROR_CODE_LEN + ORIGINAL_SIZE_LEN;
    }
    body_len += packet.payload.len();

    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(CodecError::OversizedFrame {
            limit: MAX_FRAME_BODY_BYTES,
            actual: body_len,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(msg_id_bytes.len() as u8);
    frame.extend_from_slice(msg_id_bytes);
    frame.extend_from_slice(&packet.msg_seq.to_le_bytes());
    frame.extend_from_slice(&packet.stage_id.to_le_bytes());
    if reply_direction {
        frame.extend_from_slice(&packet.error_code.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
    }
    frame.extend_from_slice(&packet.payload);
    Ok(frame)
}

/// Attempts to decode a single request/push frame (client -> server
/// direction) from the front of `buffer`. Returns `Ok(None)` if `buffer`
/// does not yet hold a complete frame; the caller should read more bytes
/// and retry.
pub fn try_decode_request_frame(buffer: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
    try_decode_frame(buffer, false)
}

/// Attempts to decode a single reply/push frame (server -> client
/// direction) from the front of `buffer`.
pub fn try_decode_reply_frame(buffer: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
    try_decode_frame(buffer, true)
}

fn try_decode_frame(
    buffer: &[u8],
    reply_direction: bool,
) -> Result<Option<(Packet, usize)>, CodecError> {
    if buffer.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let body_len = u32::from_le_bytes(buffer[0..LENGTH_PREFIX_LEN].try_into().unwrap()) as usize;
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(CodecError::OversizedFrame {
            limit: MAX_FRAME_BODY_BYTES,
            actual: body_len,
        });
    }

    let total_len = LENGTH_PREFIX_LEN + body_len;
    if buffer.len() < total_len {
        return Ok(None);
    }

    let mut cursor = LENGTH_PREFIX_LEN;
    if total_len < cursor + MSG_ID_LEN_PREFIX_LEN {
        return Err(CodecError::TruncatedFrame {
            needed: cursor + MSG_ID_LEN_PREFIX_LEN,
            have: total_len,
        });
    }
    let msg_id_len = buffer[cursor] as usize;
    cursor += MSG_ID_LEN_PREFIX_LEN;

    let fixed_tail = MSG_SEQ_LEN
        + STAGE_ID_LEN
        + if reply_direction {
            ERROR_CODE_LEN + ORIGINAL_SIZE_LEN
        } else {
            0
        };
    let after_msg_id = cursor + msg_id_len + fixed_tail;
    if total_len < after_msg_id {
        return Err(CodecError::TruncatedFrame {
            needed: after_msg_id,
            have: total_len,
        });
    }

    let msg_id = std::str::from_utf8(&buffer[cursor..cursor + msg_id_len])
        .map_err(CodecError::InvalidUtf8MsgId)?
        .to_string();
    cursor += msg_id_len;

    let msg_seq = u16::from_le_bytes(buffer[cursor..cursor + MSG_SEQ_LEN].try_into().unwrap());
    cursor += MSG_SEQ_LEN;

    let stage_id = i64::from_le_bytes(buffer[cursor..cursor + STAGE_ID_LEN].try_into().unwrap());
    cursor += STAGE_ID_LEN;

    let mut error_code = 0u16;
    if reply_direction {
        error_code =
            u16::from_le_bytes(buffer[cursor..cursor + ERROR_CODE_LEN].try_into().unwrap());
        cursor += ERROR_CODE_LEN;

        let original_size = u32::from_le_bytes(
            buffer[cursor..cursor + ORIGINAL_SIZE_LEN].try_into().unwrap(),
        );
        cursor += ORIGINAL_SIZE_LEN;
        if original_size != 0 {
            return Err(CodecError::ReservedCompressionFlagSet(original_size));
        }
    }

    let payload = buffer[cursor..total_len].to_vec();
    Ok(Some((
        Packet {
            msg_id,
            msg_seq,
            stage_id,
            error_code,
            payload,
        },
        total_len,
    )))
}

/// Encodes a [`RoutePacket`] for transmission over the node mesh.
pub fn encode_route_packet(packet: &RoutePacket) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_stdvec(packet)?)
}

/// Decodes a [`RoutePacket`] previously produced by [`encode_route_packet`].
pub fn decode_route_packet(bytes: &[u8]) -> Result<RoutePacket, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Packet {
        Packet::request("Echo", 7, 42, b"hello".to_vec())
    }

    fn sample_reply(error_code: u16) -> Packet {
        Packet::reply("Echo", 7, 42, error_code, b"hello".to_vec())
    }

    #[test]
    fn request_frame_round_trips() {
        let packet = sample_request();
        let frame = encode_request_frame(&packet).unwrap();
        let (decoded, consumed) = try_decode_request_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn reply_frame_round_trips_with_error_code() {
        let packet = sample_reply(99);
        let frame = encode_reply_frame(&packet).unwrap();
        let (decoded, consumed) = try_decode_reply_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn push_has_zero_msg_seq_after_round_trip() {
        let push = Packet::push("BroadcastNotify", 1, b"x".to_vec());
        let frame = encode_reply_frame(&push).unwrap();
        let (decoded, _) = try_decode_reply_frame(&frame).unwrap().unwrap();
        assert!(decoded.is_push());
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let frame = encode_request_frame(&sample_request()).unwrap();
        let partial = &frame[..frame.len() - 1];
        assert!(try_decode_request_frame(partial).unwrap().is_none());
        assert!(try_decode_request_frame(&frame[..2]).unwrap().is_none());
    }

    #[test]
    fn decoder_parses_back_to_back_frames() {
        let first = encode_request_frame(&sample_request()).unwrap();
        let second = encode_request_frame(&Packet::push("Ping", 0, vec![])).unwrap();
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&first);
        buffer.extend_from_slice(&second);

        let (decoded1, used1) = try_decode_request_frame(&buffer).unwrap().unwrap();
        let (decoded2, used2) = try_decode_request_frame(&buffer[used1..]).unwrap().unwrap();
        assert_eq!(decoded1.msg_id, "Echo");
        assert_eq!(decoded2.msg_id, "Ping");
        assert_eq!(used1 + used2, buffer.len());
    }

    #[test]
    fn oversized_frame_is_rejected_at_declared_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_BODY_BYTES as u32) + 1).to_le_bytes());
        let err = try_decode_request_frame(&frame).unwrap_err();
        assert!(matches!(err, CodecError::OversizedFrame { .. }));
    }

    #[test]
    fn exactly_max_body_length_is_accepted_once_buffered() {
        let payload = vec![0u8; MAX_FRAME_BODY_BYTES - (MSG_ID_LEN_PREFIX_LEN + MSG_SEQ_LEN + STAGE_ID_LEN)];
        let packet = Packet::request("", 1, 1, payload);
        let frame = encode_request_frame(&packet).unwrap();
        assert_eq!(frame.len() - LENGTH_PREFIX_LEN, MAX_FRAME_BODY_BYTES);
        let (decoded, _) = try_decode_request_frame(&frame).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), packet.payload.len());
    }

    #[test]
    fn non_zero_original_size_is_rejected() {
        let mut frame = encode_reply_frame(&sample_reply(0)).unwrap();
        // originalSize occupies the last 4 bytes before the payload; flip a bit.
        let payload_len = sample_reply(0).payload.len();
        let original_size_start = frame.len() - payload_len - ORIGINAL_SIZE_LEN;
        frame[original_size_start] = 1;
        let err = try_decode_reply_frame(&frame).unwrap_err();
        assert!(matches!(err, CodecError::ReservedCompressionFlagSet(_)));
    }

    #[test]
    fn route_packet_round_trips_through_postcard() {
        use crate::channel::ServiceId;
        use crate::model::NodeId;

        let route = RoutePacket::from_packet(
            NodeId::new(ServiceId::Play, "play-1"),
            ServiceId::Play,
            "acct-1",
            Some(NodeId::new(ServiceId::Play, "play-2")),
            Some(555),
            sample_request(),
        );
        let bytes = encode_route_packet(&route).unwrap();
        let decoded = decode_route_packet(&bytes).unwrap();
        assert_eq!(decoded, route);
    }
}
