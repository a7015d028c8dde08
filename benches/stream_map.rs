//! Stream translation benchmarks
//!
//! Measures the per-frame cost the HTTP/2 bridge adds:
//! - Stream id allocation and lookup
//! - Encoding client frames onto the upstream connection
//! - Decoding origin frames
//!
//! Run with: cargo bench --bench stream_map

use backend_bridge::h2::codec::FrameCodec;
use backend_bridge::h2::frames::{DataFrame, SettingsFrame, WindowUpdateFrame};
use backend_bridge::h2::{header_list, Settings, StreamFrame, StreamIdMap, UpstreamConnection};
use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

fn bench_stream_id_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_id_map");

    group.bench_function("allocate_1000", |b| {
        b.iter(|| {
            let map = StreamIdMap::new();
            for origin in (1..2000u32).step_by(2) {
                black_box(map.upstream_id(origin).unwrap());
            }
        });
    });

    let map = StreamIdMap::new();
    for origin in (1..2000u32).step_by(2) {
        map.upstream_id(origin).unwrap();
    }

    group.bench_function("reuse_existing", |b| {
        b.iter(|| black_box(map.upstream_id(black_box(999)).unwrap()));
    });

    group.bench_function("inverse_lookup", |b| {
        b.iter(|| black_box(map.origin_id(black_box(501))));
    });

    group.finish();
}

fn ready_connection() -> UpstreamConnection {
    let mut conn = UpstreamConnection::new(Settings::client_defaults());
    conn.preface();
    let remote = Settings {
        initial_window_size: Some(1 << 20),
        ..Settings::new()
    };
    let mut settings = BytesMut::new();
    FrameCodec::encode_settings(&SettingsFrame::new(remote), &mut settings);
    conn.receive(&settings).unwrap();
    conn.take_outbound();
    conn
}

fn bench_upstream_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("upstream_send");

    let headers = StreamFrame::headers(
        1,
        header_list([
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/index.html"),
            (":authority", "origin.example"),
            ("user-agent", "bench"),
        ]),
        true,
    );
    group.bench_function("headers", |b| {
        let mut conn = ready_connection();
        b.iter(|| {
            conn.send(black_box(&headers)).unwrap();
            black_box(conn.take_outbound());
        });
    });

    for size in [1024usize, 16 * 1024, 256 * 1024] {
        let frame = StreamFrame::data(1, Bytes::from(vec![0u8; size]), false);

        // The origin hands back what each iteration used
        let mut credit = BytesMut::new();
        for stream_id in [0, 1] {
            FrameCodec::encode_window_update(
                &WindowUpdateFrame {
                    stream_id,
                    size_increment: size as u32,
                },
                &mut credit,
            );
        }
        let credit = credit.freeze();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data", size), &frame, |b, frame| {
            let mut conn = ready_connection();
            b.iter(|| {
                conn.send(black_box(frame)).unwrap();
                black_box(conn.take_outbound());
                black_box(conn.receive(&credit).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_origin_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("origin_decode");

    let mut wire = BytesMut::new();
    for _ in 0..16 {
        FrameCodec::encode_data(
            &DataFrame::new(1, Bytes::from(vec![0u8; 1024]), false),
            &mut wire,
        );
    }
    let wire = wire.freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("data_x16", |b| {
        let codec = FrameCodec::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                black_box(frame);
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = translation;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(200);
    targets =
        bench_stream_id_allocation,
        bench_upstream_send,
        bench_origin_decode
}

criterion_main!(translation);
