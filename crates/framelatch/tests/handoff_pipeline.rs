//! # Hand-off Pipeline Tests
//!
//! Producer, buffer queue, surface, compositor and software poster wired
//! together the way the demo binary does it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use framelatch::core::{BufferQueue, HeapAllocator, PixelFormat, PoolError, SlotTable, SyncTimeline};
use framelatch::display::{DisplayMode, DisplayPoster, HandoffSurface, SoftwarePoster, SurfaceConfig};
use framelatch::{Compositor, CompositorConfig, FrameProducer, HandoffEvent, ProducerConfig, ProducerError};

const MODE: DisplayMode = DisplayMode {
    width: 64,
    height: 48,
    format: PixelFormat::Rgbx8888,
    refresh_hz: 60,
};

struct Pipeline {
    queue: Arc<BufferQueue>,
    poster: Arc<SoftwarePoster>,
    surface: Arc<HandoffSurface>,
    compositor: Compositor,
    producer: FrameProducer,
}

fn pipeline(buffers: usize, vsync_interval_us: u64) -> Pipeline {
    let queue = Arc::new(BufferQueue::new(Arc::new(HeapAllocator::new())));
    let poster = Arc::new(SoftwarePoster::new(MODE));
    let surface = Arc::new(
        HandoffSurface::new(
            &SurfaceConfig {
                name: String::from("pipeline"),
                max_buffer_count: buffers,
                ..SurfaceConfig::default()
            },
            Arc::clone(&queue) as Arc<dyn SlotTable>,
            Arc::clone(&poster) as Arc<dyn DisplayPoster>,
        )
        .unwrap(),
    );
    let compositor = Compositor::new(
        CompositorConfig {
            vsync_interval_us,
            fence_timeout_ms: 50,
            ..CompositorConfig::default()
        },
        Arc::clone(&surface),
        Arc::clone(&poster),
    );
    queue.set_consumer_listener(compositor.listener());
    let producer = FrameProducer::new(
        Arc::clone(&queue),
        &ProducerConfig {
            dequeue_timeout_ms: 200,
            fence_timeout_ms: 200,
            ..ProducerConfig::default()
        },
    );
    Pipeline {
        queue,
        poster,
        surface,
        compositor,
        producer,
    }
}

#[test]
fn test_frames_reach_screen_in_order() {
    let mut p = pipeline(3, 0);

    for expected in 1..=6 {
        let frame = p.producer.produce_frame().unwrap();
        assert_eq!(frame.frame_number, expected);

        assert!(p.compositor.run_pending());
        assert!(p.compositor.dispatch(HandoffEvent::Vsync));

        let on_screen = p.poster.on_screen().unwrap();
        assert_eq!(on_screen.id(), frame.buffer);
        assert_eq!(p.surface.current_slot(), Some(frame.slot));
    }

    let stats = p.compositor.stats();
    assert_eq!(stats.frames_posted, 6);
    assert_eq!(stats.flips, 6);
    assert_eq!(stats.errors, 0);
    assert_eq!(p.surface.frames_latched(), 6);
}

#[test]
fn test_buffers_are_recycled_without_reallocation() {
    let mut p = pipeline(2, 0);
    let mut reallocations = 0;

    for _ in 0..10 {
        let frame = p.producer.produce_frame().unwrap();
        if frame.reallocated {
            reallocations += 1;
        }
        p.compositor.run_pending();
        p.compositor.dispatch(HandoffEvent::Vsync);
    }

    // One allocation per slot, then reuse.
    assert_eq!(reallocations, 2);
    assert_eq!(p.compositor.stats().errors, 0);
}

#[test]
fn test_late_frame_flips_on_next_vsync() {
    let mut p = pipeline(3, 0);
    let gpu = SyncTimeline::new("gpu");

    let frame = p.producer.queue_with_fence(gpu.create_fence(1)).unwrap();
    p.compositor.run_pending();

    // Acquire fence still pending: the vsync is missed.
    p.compositor.dispatch(HandoffEvent::Vsync);
    assert!(p.poster.on_screen().is_none());
    assert_eq!(p.compositor.stats().late_frames, 1);

    gpu.advance(1);
    p.compositor.dispatch(HandoffEvent::Vsync);
    assert_eq!(p.poster.on_screen().unwrap().id(), frame.buffer);
}

#[test]
fn test_resize_frees_current_slot() {
    let mut p = pipeline(2, 0);

    p.producer.produce_frame().unwrap();
    p.compositor.run_pending();
    p.compositor.dispatch(HandoffEvent::Vsync);
    assert!(p.surface.current_slot().is_some());

    p.producer.resize(32, 24);
    p.compositor.run_pending();
    assert_eq!(p.surface.current_slot(), None);
    assert!(p.compositor.stats().slots_freed >= 1);

    let frame = p.producer.produce_frame().unwrap();
    assert!(frame.reallocated);
    p.compositor.run_pending();
    p.compositor.dispatch(HandoffEvent::Vsync);

    let on_screen = p.poster.on_screen().unwrap();
    assert_eq!(on_screen.id(), frame.buffer);
    assert_eq!((on_screen.width(), on_screen.height()), (32, 24));
    assert_eq!(p.compositor.stats().errors, 0);
}

#[test]
fn test_threaded_pipeline_shuts_down_cleanly() {
    const FRAMES: u64 = 30;

    let Pipeline {
        queue,
        poster,
        surface,
        mut compositor,
        mut producer,
    } = pipeline(3, 1_000);
    let events = compositor.sender();
    let compositor_thread = thread::spawn(move || compositor.run());

    for _ in 0..FRAMES {
        producer.produce_frame().unwrap();
        events.send(HandoffEvent::CompositionComplete);
        thread::sleep(Duration::from_micros(500));
    }
    thread::sleep(Duration::from_millis(10));

    assert!(events.send_blocking(HandoffEvent::Shutdown));
    let stats = compositor_thread.join().unwrap();

    assert_eq!(stats.errors, 0);
    assert_eq!(stats.frames_posted, FRAMES);
    assert!(poster.stats().flips >= 1);
    assert_eq!(poster.stats().compositions, FRAMES);
    assert!(surface.is_abandoned());
    assert!(queue.is_abandoned());

    assert_eq!(
        producer.produce_frame().unwrap_err(),
        ProducerError::Pool(PoolError::Abandoned)
    );
}
