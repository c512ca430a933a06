//! Criterion benchmarks for the decimation inner loop.
//!
//! The transform decimates every archived channel of every incoming block, so
//! this path bounds how many channels the archiver can keep up with.
//!
//! Run with: cargo bench --bench decimate

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fa_decimation::{decimate_strided, ChannelAccumulator, ChannelKind};
use fa_format::FaEntry;

const FRAME_CHANNELS: usize = 256;
const FRAME_BYTES: usize = FRAME_CHANNELS * FaEntry::SIZE;

fn make_frames(count: usize) -> Vec<u8> {
    let mut frames = vec![0u8; count * FRAME_BYTES];
    for (i, chunk) in frames.chunks_exact_mut(FaEntry::SIZE).enumerate() {
        let v = (i as i32).wrapping_mul(7919) % 100_000;
        FaEntry::new(v, -v).write_to(chunk);
    }
    frames
}

/// Decimates one channel column of an interleaved block.
fn decimate_column(c: &mut Criterion) {
    let mut group = c.benchmark_group("decimate_column");

    for log2 in [4u32, 6, 8] {
        let count = 1usize << log2;
        let frames = make_frames(count);

        group.throughput(Throughput::Elements(count as u64));
        for kind in [ChannelKind::Position, ChannelKind::Events] {
            let name = format!("{kind:?}");
            group.bench_with_input(BenchmarkId::new(name, count), &count, |b, &count| {
                b.iter(|| {
                    let mut acc = ChannelAccumulator::new(kind);
                    decimate_strided(black_box(&frames), FRAME_BYTES, count, &mut acc);
                    black_box(acc.result(log2))
                });
            });
        }
    }

    group.finish();
}

/// Decimates every channel of a block, as the transform does per d-sample.
fn decimate_all_channels(c: &mut Criterion) {
    let mut group = c.benchmark_group("decimate_frame_block");
    let count = 64;
    let frames = make_frames(count);

    group.throughput(Throughput::Bytes(frames.len() as u64));
    group.bench_function("256_channels", |b| {
        let mut accs: Vec<_> = (0..FRAME_CHANNELS)
            .map(|_| ChannelAccumulator::new(ChannelKind::Position))
            .collect();
        b.iter(|| {
            for (channel, acc) in accs.iter_mut().enumerate() {
                acc.reset();
                decimate_strided(&frames[channel * FaEntry::SIZE..], FRAME_BYTES, count, acc);
                black_box(acc.result(6));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, decimate_column, decimate_all_channels);
criterion_main!(benches);
