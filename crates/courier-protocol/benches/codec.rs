//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, ClusterAction, ClusterFrame, Frame};

fn bench_encode_data(c: &mut Criterion) {
    let frame = Frame::Data {
        topic: "grp1".to_string(),
        from: "n1-1f".to_string(),
        user: Some("alice".to_string()),
        seq: 42,
        timestamp: 1_700_000_000_000,
        payload: vec![0u8; 64],
    };

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("data_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_publish(c: &mut Criterion) {
    let frame = Frame::publish(1, "grp1", vec![0u8; 64]);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("publish_64B", |b| {
        b.iter(|| codec::decode::<Frame>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_cluster_relay(c: &mut Criterion) {
    let inner = codec::encode(&Frame::publish(1, "grp1", vec![0u8; 256])).unwrap();
    let frame = ClusterFrame::request(7, "n1", "n2", ClusterAction::Relay, "grp1", inner.to_vec());

    c.bench_function("cluster_relay_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode::<ClusterFrame>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_data,
    bench_decode_publish,
    bench_cluster_relay
);
criterion_main!(benches);
