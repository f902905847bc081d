//! Codec and dispatch benchmarks.
//!
//! Run with: cargo bench -p mqtt-session

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use mqtt_session::protocol::{MAX_PACKET_SIZE, Packet, Publish, Subscribe, SubscribeFilter, codec};
use mqtt_session::{Message, QoS, ServeMux};

fn publish(size: usize) -> Packet {
    Packet::Publish(Publish {
        topic: "sensors/livingroom/temperature".to_string(),
        payload: Bytes::from(vec![0u8; size]),
        qos: QoS::AtLeastOnce,
        retain: false,
        dup: false,
        pkid: 42,
    })
}

fn bench_variable_int(c: &mut Criterion) {
    let mut group = c.benchmark_group("variable_int");
    for value in [127u32, 16_383, 2_097_151, 268_435_455] {
        let mut encoded = BytesMut::new();
        codec::write_variable_int(&mut encoded, value).unwrap();

        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &v| {
            let mut buf = BytesMut::with_capacity(4);
            b.iter(|| {
                buf.clear();
                codec::write_variable_int(&mut buf, black_box(v)).unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", value), &encoded, |b, enc| {
            b.iter(|| codec::read_variable_int(black_box(enc)).unwrap());
        });
    }
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for size in [64usize, 1024, 16 * 1024] {
        let packet = publish(size);
        let encoded = packet.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, p| {
            let mut buf = BytesMut::with_capacity(encoded.len());
            b.iter(|| {
                buf.clear();
                p.write(&mut buf).unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, enc| {
            b.iter(|| Packet::read(black_box(enc), MAX_PACKET_SIZE).unwrap());
        });
    }
    group.finish();
}

fn bench_subscribe(c: &mut Criterion) {
    let packet = Packet::Subscribe(Subscribe {
        pkid: 7,
        filters: (0..8)
            .map(|i| SubscribeFilter {
                path: format!("device/{}/+/state", i),
                qos: QoS::AtMostOnce,
            })
            .collect(),
    });
    let encoded = packet.to_bytes().unwrap();

    c.bench_function("subscribe/decode_8_filters", |b| {
        b.iter(|| Packet::read(black_box(&encoded), MAX_PACKET_SIZE).unwrap());
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let mux = ServeMux::new();
    let hits = Arc::new(AtomicUsize::new(0));
    for room in ["kitchen", "livingroom", "bedroom", "garage"] {
        for sensor in ["temperature", "humidity", "motion"] {
            let hits = hits.clone();
            mux.handle_func(&format!("sensors/{}/{}", room, sensor), move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        }
    }
    let hits_all = hits.clone();
    mux.handle_func("sensors/#", move |_| {
        hits_all.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
    .unwrap();
    mux.handle_func("sensors/+/temperature", |_| Ok(())).unwrap();

    let msg = Message::new("sensors/livingroom/temperature", "23.5");
    c.bench_function("dispatch/three_matches", |b| {
        b.iter(|| mux.handle_message(black_box(&msg)));
    });

    let miss = Message::new("actuators/garage/door", "open");
    c.bench_function("dispatch/no_match", |b| {
        b.iter(|| mux.handle_message(black_box(&miss)));
    });
}

criterion_group!(
    benches,
    bench_variable_int,
    bench_publish,
    bench_subscribe,
    bench_dispatch
);
criterion_main!(benches);
