//! # Hand-off Benchmark
//!
//! Measures the CPU cost of one frame through the hand-off path:
//! 1. dequeue + queue on the producer side
//! 2. latch (acquire, release previous) on the surface
//! 3. post + vsync on the software poster
//!
//! No fences are pending, so nothing here waits.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use framelatch_core::{BufferQueue, DequeueRequest, Fence, HeapAllocator, PixelFormat, SlotTable};
use framelatch_display::{DisplayMode, DisplayPoster, HandoffSurface, SoftwarePoster, SurfaceConfig};

const MODE: DisplayMode = DisplayMode {
    width: 1920,
    height: 1080,
    format: PixelFormat::Rgbx8888,
    refresh_hz: 60,
};

fn setup(buffer_count: usize) -> (Arc<BufferQueue>, Arc<SoftwarePoster>, HandoffSurface) {
    let queue = Arc::new(BufferQueue::new(Arc::new(HeapAllocator::new())));
    let poster = Arc::new(SoftwarePoster::new(MODE));
    let config = SurfaceConfig {
        max_buffer_count: buffer_count,
        ..SurfaceConfig::default()
    };
    let surface = HandoffSurface::new(
        &config,
        Arc::clone(&queue) as Arc<dyn SlotTable>,
        Arc::clone(&poster) as Arc<dyn DisplayPoster>,
    )
    .expect("surface");
    (queue, poster, surface)
}

/// Producer-to-latch cost, driven by hand (no listener).
fn bench_latch(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff_latch");

    for buffer_count in [2, 3, 8] {
        let (queue, _poster, surface) = setup(buffer_count);

        group.bench_with_input(
            BenchmarkId::new("dequeue_queue_latch", buffer_count),
            &buffer_count,
            |b, _| {
                b.iter(|| {
                    let dequeued = queue
                        .try_dequeue_buffer(&DequeueRequest::default())
                        .expect("dequeue");
                    queue.queue_buffer(dequeued.slot, Fence::NO_FENCE).expect("queue");
                    black_box(surface.next_buffer().expect("latch"));
                });
            },
        );
    }

    group.finish();
}

/// Full frame: latch, post, flip, attach the release fence.
fn bench_full_frame(c: &mut Criterion) {
    let (queue, poster, surface) = setup(3);

    c.bench_function("handoff_full_frame", |b| {
        b.iter(|| {
            let dequeued = queue
                .try_dequeue_buffer(&DequeueRequest::default())
                .expect("dequeue");
            queue.queue_buffer(dequeued.slot, Fence::NO_FENCE).expect("queue");
            surface.on_buffer_ready().expect("post");
            if let Some(flip) = poster.vsync(Duration::ZERO).expect("vsync") {
                surface.set_release_fence(flip.release_fence).expect("fence");
            }
        });
    });
}

/// Nothing queued: the surface hands back the previous frame.
fn bench_empty_latch(c: &mut Criterion) {
    let (queue, _poster, surface) = setup(2);
    let dequeued = queue
        .try_dequeue_buffer(&DequeueRequest::default())
        .expect("dequeue");
    queue.queue_buffer(dequeued.slot, Fence::NO_FENCE).expect("queue");
    surface.next_buffer().expect("latch");

    c.bench_function("handoff_empty_latch", |b| {
        b.iter(|| black_box(surface.next_buffer().expect("latch")));
    });
}

criterion_group!(benches, bench_latch, bench_full_frame, bench_empty_latch);
criterion_main!(benches);
