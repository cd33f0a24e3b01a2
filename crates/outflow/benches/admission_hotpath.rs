//! Per-packet admission cost benchmarks for outflow.
//!
//! Measures the work `send_packet` does under the packet lock:
//! - Video admission with the buffer drained as fast as it fills
//! - Video admission during sustained congestion (drop passes firing)
//! - Bitrate controller evaluation against a populated estimator
//! - Strain sample recording + averaging
//!
//! Run with: cargo bench --package outflow

use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Instant;

use outflow::bitrate::BitrateController;
use outflow::buffer::PacketBuffer;
use outflow::drop_policy::{DropController, DropThresholds};
use outflow::estimator::{StrainEstimator, MIN_BUFFER_CAPACITY};
use outflow::packet::{DropPriority, OutboundPacket};

const FRAME_USEC: i64 = 33_333;

fn frame(n: i64, payload: &Bytes) -> OutboundPacket {
    let priority = if n % 3 == 0 { DropPriority::High } else { DropPriority::Low };
    let pkt = OutboundPacket::video(payload.clone(), n * FRAME_USEC, n * FRAME_USEC, priority);
    if n % 60 == 0 {
        pkt.with_keyframe()
    } else {
        pkt
    }
}

fn bench_admit_steady(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_steady");
    group.throughput(Throughput::Elements(1));

    let payload = Bytes::from(vec![0u8; 4096]);
    let mut buffer = PacketBuffer::new();
    let mut ctl = DropController::new(DropThresholds::default());
    let mut n = 0i64;

    group.bench_function("admit_then_pop", |b| {
        b.iter(|| {
            let pkt = frame(n, &payload);
            n += 1;
            black_box(ctl.try_admit_video(&mut buffer, pkt));
            // Keep a handful queued so the drop check runs every time.
            if buffer.len() > 8 {
                black_box(buffer.pop_front());
            }
        });
    });

    group.finish();
}

fn bench_admit_congested(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_congested");
    group.throughput(Throughput::Elements(1));

    let payload = Bytes::from(vec![0u8; 4096]);
    let mut buffer = PacketBuffer::new();
    let mut ctl = DropController::new(DropThresholds::default());
    let mut n = 0i64;

    // Nothing is ever sent: every threshold crossing triggers a pass.
    group.bench_function("admit_no_drain", |b| {
        b.iter(|| {
            let pkt = frame(n, &payload);
            n += 1;
            black_box(ctl.try_admit_video(&mut buffer, pkt));
            // Bound memory across iterations; keyframes are never dropped.
            if buffer.len() > 4096 {
                buffer.clear();
            }
        });
    });

    group.finish();
}

fn bench_bitrate_eval(c: &mut Criterion) {
    let estimator = StrainEstimator::new(MIN_BUFFER_CAPACITY);
    let start = Instant::now();
    for i in 0..200u64 {
        let at = start + Duration::from_millis(i * 5);
        estimator.record_send(1400, at);
        estimator.record_strain(40_000, MIN_BUFFER_CAPACITY, at);
    }
    let mut ctl = BitrateController::new(2500, 4000, 128, start);

    c.bench_function("bitrate_on_video_packet", |b| {
        b.iter(|| {
            black_box(ctl.on_video_packet(
                None,
                Duration::from_millis(120),
                false,
                &estimator,
                start + Duration::from_millis(500),
            ))
        });
    });
}

fn bench_estimator(c: &mut Criterion) {
    let estimator = StrainEstimator::new(MIN_BUFFER_CAPACITY);
    let start = Instant::now();
    let mut i = 0u64;

    c.bench_function("estimator_record_and_average", |b| {
        b.iter(|| {
            let at = start + Duration::from_micros(i * 500);
            i += 1;
            estimator.record_strain(black_box(65_536), MIN_BUFFER_CAPACITY, at);
            black_box(estimator.average_strain())
        });
    });
}

criterion_group!(
    benches,
    bench_admit_steady,
    bench_admit_congested,
    bench_bitrate_eval,
    bench_estimator,
);
criterion_main!(benches);
