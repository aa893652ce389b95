use protocol::channel::ServiceId;
use protocol::codec::{
    decode_route_packet, encode_reply_frame, encode_request_frame, encode_route_packet,
    try_decode_reply_frame, try_decode_request_frame, CodecError,
};
use protocol::model::{NodeId, Packet, RoutePacket};

#[test]
fn echo_request_round_trips_over_the_client_wire() {
    let request = Packet::request("Echo", 7, 42, b"hi".to_vec());
    let frame = encode_request_frame(&request).unwrap();
    let (decoded, consumed) = try_decode_request_frame(&frame).unwrap().unwrap();

    assert_eq!(consumed, frame.len());
    assert_eq!(decoded, request);
}

#[test]
fn echo_reply_carries_matching_msg_seq_and_error_code() {
    let request = Packet::request("Echo", 7, 42, b"hi".to_vec());
    let reply = Packet::reply(
        request.msg_id.clone(),
        request.msg_seq,
        request.stage_id,
        0,
        request.payload.clone(),
    );

    let frame = encode_reply_frame(&reply).unwrap();
    let (decoded, _) = try_decode_reply_frame(&frame).unwrap().unwrap();

    assert_eq!(decoded.msg_seq, request.msg_seq);
    assert!(decoded.is_success());
    assert_eq!(decoded.payload, request.payload);
}

#[test]
fn push_decodes_with_msg_seq_zero() {
    let push = Packet::push("BroadcastNotify", 1, b"hello stage".to_vec());
    let frame = encode_reply_frame(&push).unwrap();
    let (decoded, _) = try_decode_reply_frame(&frame).unwrap().unwrap();
    assert!(decoded.is_push());
}

#[test]
fn empty_msg_id_is_accepted() {
    let packet = Packet::request("", 1, 1, vec![]);
    let frame = encode_request_frame(&packet).unwrap();
    let (decoded, _) = try_decode_request_frame(&frame).unwrap().unwrap();
    assert_eq!(decoded.msg_id, "");
}

#[test]
fn decoder_reports_none_until_whole_frame_is_buffered() {
    let packet = Packet::request("Move", 3, 9, vec![1, 2, 3, 4, 5]);
    let frame = encode_request_frame(&packet).unwrap();

    for cut in 0..frame.len() {
        assert!(try_decode_request_frame(&frame[..cut]).unwrap().is_none());
    }
    assert!(try_decode_request_frame(&frame).unwrap().is_some());
}

#[test]
fn declared_length_over_the_limit_is_rejected_before_buffering_payload() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&((2 * 1024 * 1024u32) + 1).to_le_bytes());
    let err = try_decode_request_frame(&frame).unwrap_err();
    assert!(matches!(err, CodecError::OversizedFrame { .. }));
}

#[test]
fn route_packet_survives_the_mesh_wire() {
    let route = RoutePacket::from_packet(
        NodeId::new(ServiceId::Play, "play-1"),
        ServiceId::Play,
        "acct-42",
        Some(NodeId::new(ServiceId::Play, "play-2")),
        Some(9001),
        Packet::request("UseSkill", 12, 5, vec![9, 9, 9]),
    );

    let bytes = encode_route_packet(&route).unwrap();
    let decoded = decode_route_packet(&bytes).unwrap();

    assert_eq!(decoded, route);
    assert_eq!(decoded.into_packet(), route_into_packet(&route));

    fn route_into_packet(r: &RoutePacket) -> Packet {
        Packet {
            msg_id: r.msg_id.clone(),
            msg_seq: r.msg_seq,
            stage_id: r.stage_id,
            error_code: r.error_code,
            payload: r.payload.clone(),
        }
    }
}
