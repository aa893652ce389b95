use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use protocol::codec::{encode_reply_frame, encode_request_frame, try_decode_request_frame};
use protocol::model::Packet;

fn sample_move_packet() -> Packet {
    Packet::request("Move", 100, 1, vec![1, 1, 2, 3, 5, 8, 13, 21])
}

fn sample_hello_packet() -> Packet {
    Packet::request("Hello", 1, 0, b"bench-token".to_vec())
}

fn bench_request_frame(c: &mut Criterion) {
    let packet = sample_move_packet();

    c.bench_with_input(
        BenchmarkId::new("encode_request", "move"),
        &packet,
        |b, packet| {
            b.iter(|| encode_request_frame(black_box(packet)).unwrap());
        },
    );

    let frame = encode_request_frame(&packet).unwrap();
    c.bench_with_input(
        BenchmarkId::new("decode_request", "move"),
        &frame,
        |b, frame| {
            b.iter(|| try_decode_request_frame(black_box(frame)).unwrap().unwrap());
        },
    );
}

fn bench_reply_frame(c: &mut Criterion) {
    let packet = sample_hello_packet();

    c.bench_with_input(
        BenchmarkId::new("encode_reply", "hello"),
        &packet,
        |b, packet| {
            b.iter(|| encode_reply_frame(black_box(packet)).unwrap());
        },
    );
}

fn protocol_benches(c: &mut Criterion) {
    bench_request_frame(c);
    bench_reply_frame(c);
}

criterion_group!(benches, protocol_benches);
criterion_main!(benches);
