//! # Compositor Loop
//!
//! The single thread that owns every call into the hand-off surface.
//!
//! ```text
//! loop:
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. WAIT for the next event or the next vsync deadline               │
//! │                                                                     │
//! │ 2. DISPATCH                                                         │
//! │    ├─ FrameAvailable     → surface latches and posts                │
//! │    ├─ SlotFreed(n)       → surface forgets slot n if current        │
//! │    ├─ Vsync              → poster flips, release fence → surface    │
//! │    ├─ CompositionComplete→ forwarded to the poster                  │
//! │    └─ Shutdown           → surface abandons the queue, loop ends    │
//! │                                                                     │
//! │ 3. ACCOUNT                                                          │
//! │    └─ warn when a dispatch blows the frame budget                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use framelatch_display::{HandoffSurface, PosterError, SoftwarePoster};
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, EventReceiver, EventSender, HandoffEvent};

/// Configuration for the compositor loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompositorConfig {
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Interval between internally generated vsyncs, in microseconds.
    /// Zero means vsync only arrives as an event.
    pub vsync_interval_us: u64,
    /// Dispatch time above which a warning is logged, in microseconds.
    pub frame_budget_us: u64,
    /// How long a flip waits for the acquire fence, in milliseconds.
    pub fence_timeout_ms: u64,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            vsync_interval_us: 16_666,
            frame_budget_us: 16_666,
            fence_timeout_ms: 100,
        }
    }
}

impl CompositorConfig {
    /// Vsync period, or `None` when vsync is event driven.
    #[must_use]
    pub fn vsync_interval(&self) -> Option<Duration> {
        (self.vsync_interval_us > 0).then(|| Duration::from_micros(self.vsync_interval_us))
    }

    /// Per-dispatch time budget.
    #[must_use]
    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros(self.frame_budget_us)
    }

    /// Acquire fence timeout used at flip time.
    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

/// Counters kept by the compositor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompositorStats {
    /// Events dispatched, shutdown included.
    pub events_processed: u64,
    /// Successful latch-and-post rounds.
    pub frames_posted: u64,
    /// Frames that reached the screen.
    pub flips: u64,
    /// Vsyncs with nothing pending.
    pub idle_vsyncs: u64,
    /// Vsyncs where the acquire fence had not signaled in time.
    pub late_frames: u64,
    /// Slot-freed notifications.
    pub slots_freed: u64,
    /// Hand-off or poster errors.
    pub errors: u64,
    /// Dispatches that exceeded the frame budget.
    pub over_budget: u64,
    /// Longest single dispatch, in microseconds.
    pub max_dispatch_us: u64,
}

/// Drives a [`HandoffSurface`] and a [`SoftwarePoster`] from one thread.
pub struct Compositor {
    surface: Arc<HandoffSurface>,
    poster: Arc<SoftwarePoster>,
    listener: Arc<EventSender>,
    events: EventReceiver,
    config: CompositorConfig,
    stats: CompositorStats,
    /// Dropped frame notices already made up for.
    recovered_frames: u64,
}

impl Compositor {
    /// Creates a compositor with its own event bus.
    #[must_use]
    pub fn new(config: CompositorConfig, surface: Arc<HandoffSurface>, poster: Arc<SoftwarePoster>) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            surface,
            poster,
            listener: Arc::new(bus.sender()),
            events: bus.receiver(),
            config,
            stats: CompositorStats::default(),
            recovered_frames: 0,
        }
    }

    /// The pool listener to register with the buffer queue.
    ///
    /// The queue keeps a weak reference; the compositor keeps this one alive.
    #[must_use]
    pub fn listener(&self) -> &Arc<EventSender> {
        &self.listener
    }

    /// A sender for vsync, composition and shutdown events.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender::clone(&self.listener)
    }

    /// The surface driven by this compositor.
    #[must_use]
    pub fn surface(&self) -> &Arc<HandoffSurface> {
        &self.surface
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> CompositorStats {
        self.stats
    }

    /// Handles one event. Returns `false` once shutdown was processed.
    pub fn dispatch(&mut self, event: HandoffEvent) -> bool {
        let start = Instant::now();
        self.stats.events_processed += 1;

        let keep_running = match event {
            HandoffEvent::FrameAvailable => {
                if self.latch_and_post() {
                    self.recover_missed_frames();
                }
                true
            }
            HandoffEvent::SlotFreed(slot) => {
                self.surface.on_slot_freed(slot);
                self.stats.slots_freed += 1;
                true
            }
            HandoffEvent::Vsync => {
                self.vsync();
                true
            }
            HandoffEvent::CompositionComplete => {
                if let Err(err) = self.surface.composition_complete() {
                    tracing::error!("composition complete failed: {}", err);
                    self.stats.errors += 1;
                }
                true
            }
            HandoffEvent::Shutdown => {
                if let Err(err) = self.surface.abandon() {
                    tracing::error!("failed to abandon surface: {}", err);
                    self.stats.errors += 1;
                }
                false
            }
        };

        let elapsed = start.elapsed();
        let elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.stats.max_dispatch_us = self.stats.max_dispatch_us.max(elapsed_us);
        if elapsed > self.config.frame_budget() {
            self.stats.over_budget += 1;
            tracing::warn!(
                "{:?} took {:.2}ms (budget {:.2}ms)",
                event,
                elapsed.as_secs_f64() * 1000.0,
                self.config.frame_budget().as_secs_f64() * 1000.0
            );
        }
        keep_running
    }

    /// Returns whether a newly queued frame was latched.
    fn latch_and_post(&mut self) -> bool {
        match self.surface.on_buffer_ready() {
            Ok(fresh) => {
                self.stats.frames_posted += 1;
                fresh
            }
            Err(_) => {
                self.stats.errors += 1;
                false
            }
        }
    }

    /// Latches one frame per dropped notice, stopping once the queue is empty.
    fn recover_missed_frames(&mut self) {
        let missed = self.listener.missed_frame_count();
        if missed == self.recovered_frames {
            return;
        }
        let pending = missed - self.recovered_frames;
        self.recovered_frames = missed;
        tracing::debug!("latching {} frames whose notices were dropped", pending);
        for _ in 0..pending {
            if !self.latch_and_post() {
                break;
            }
        }
    }

    fn vsync(&mut self) {
        self.recover_missed_frames();
        match self.poster.vsync(self.config.fence_timeout()) {
            Ok(Some(flip)) => {
                self.stats.flips += 1;
                // The flipped buffer is still current unless a newer frame was latched.
                let still_current =
                    self.surface.current_buffer().map(|b| b.id()) == Some(flip.buffer.id());
                if still_current && self.surface.set_release_fence(flip.release_fence).is_err() {
                    self.stats.errors += 1;
                }
            }
            Ok(None) => self.stats.idle_vsyncs += 1,
            Err(PosterError::FenceTimeout(timeout)) => {
                self.stats.late_frames += 1;
                tracing::debug!("frame missed vsync, acquire fence pending after {:?}", timeout);
            }
            Err(err) => {
                self.stats.errors += 1;
                tracing::error!("vsync failed: {}", err);
            }
        }
    }

    /// Dispatches every pending event without waiting.
    ///
    /// Returns `false` if a shutdown was among them.
    pub fn run_pending(&mut self) -> bool {
        for event in self.events.drain() {
            if !self.dispatch(event) {
                return false;
            }
        }
        true
    }

    /// Runs until a [`HandoffEvent::Shutdown`] is dispatched.
    ///
    /// With a vsync interval configured, a vsync is dispatched every
    /// interval between events.
    pub fn run(&mut self) -> CompositorStats {
        tracing::info!(
            "compositor running for '{}' (vsync {:?})",
            self.surface.name(),
            self.config.vsync_interval()
        );

        match self.config.vsync_interval() {
            None => while self.dispatch(self.events.recv()) {},
            Some(interval) => {
                let mut next_vsync = Instant::now() + interval;
                loop {
                    let now = Instant::now();
                    if now >= next_vsync {
                        self.dispatch(HandoffEvent::Vsync);
                        next_vsync += interval;
                        if next_vsync <= now {
                            // Fell behind; skip the missed vsyncs.
                            next_vsync = now + interval;
                        }
                        continue;
                    }
                    if let Some(event) = self.events.recv_timeout(next_vsync - now) {
                        if !self.dispatch(event) {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(
            "compositor stopped: {} posted, {} flipped, {} errors",
            self.stats.frames_posted,
            self.stats.flips,
            self.stats.errors
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelatch_core::{
        BufferQueue, DequeueRequest, Fence, HeapAllocator, PixelFormat, SlotIndex, SlotState, SlotTable,
        SyncTimeline,
    };
    use framelatch_display::{DisplayMode, DisplayPoster, SurfaceConfig};

    struct Rig {
        queue: Arc<BufferQueue>,
        poster: Arc<SoftwarePoster>,
        compositor: Compositor,
    }

    fn rig() -> Rig {
        rig_with(3, CompositorConfig::default().event_capacity)
    }

    fn rig_with(buffers: usize, event_capacity: usize) -> Rig {
        let queue = Arc::new(BufferQueue::new(Arc::new(HeapAllocator::new())));
        let poster = Arc::new(SoftwarePoster::new(DisplayMode {
            width: 32,
            height: 32,
            format: PixelFormat::Rgbx8888,
            refresh_hz: 60,
        }));
        let surface = Arc::new(
            HandoffSurface::new(
                &SurfaceConfig {
                    max_buffer_count: buffers,
                    ..SurfaceConfig::default()
                },
                Arc::clone(&queue) as Arc<dyn SlotTable>,
                Arc::clone(&poster) as Arc<dyn DisplayPoster>,
            )
            .unwrap(),
        );
        let config = CompositorConfig {
            event_capacity,
            vsync_interval_us: 0,
            fence_timeout_ms: 5,
            ..CompositorConfig::default()
        };
        let compositor = Compositor::new(config, surface, Arc::clone(&poster));
        queue.set_consumer_listener(compositor.listener());
        Rig {
            queue,
            poster,
            compositor,
        }
    }

    fn queue_frame(queue: &BufferQueue, fence: Fence) -> SlotIndex {
        let dequeued = queue.try_dequeue_buffer(&DequeueRequest::default()).unwrap();
        queue.queue_buffer(dequeued.slot, fence).unwrap();
        dequeued.slot
    }

    fn assert_single_current(rig: &Rig) {
        let states = rig.queue.slot_states();
        let acquired: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == SlotState::Acquired)
            .map(|(index, _)| index)
            .collect();
        let current = rig.compositor.surface().current_slot().map(SlotIndex::as_usize);
        assert_eq!(acquired.len(), 1, "{states:?}");
        assert_eq!(Some(acquired[0]), current);
    }

    fn slot_line(queue: &BufferQueue, slot: SlotIndex) -> String {
        let mut dump = String::new();
        queue.dump(&mut dump, "");
        let tag = format!("[{:02}]", slot.as_usize());
        dump.lines()
            .find(|line| line.trim_start().starts_with(&tag))
            .unwrap_or_default()
            .to_owned()
    }

    #[test]
    fn test_config_defaults() {
        let config = CompositorConfig::default();
        assert_eq!(config.vsync_interval(), Some(Duration::from_micros(16_666)));
        assert_eq!(config.fence_timeout(), Duration::from_millis(100));

        let manual = CompositorConfig {
            vsync_interval_us: 0,
            ..config
        };
        assert_eq!(manual.vsync_interval(), None);
    }

    #[test]
    fn test_frame_is_posted_then_flipped() {
        let mut rig = rig();
        queue_frame(&rig.queue, Fence::NO_FENCE);
        assert!(rig.compositor.run_pending());
        assert!(rig.poster.has_pending());

        assert!(rig.compositor.dispatch(HandoffEvent::Vsync));
        let stats = rig.compositor.stats();
        assert_eq!(stats.frames_posted, 1);
        assert_eq!(stats.flips, 1);
        assert_eq!(
            rig.poster.on_screen().map(|b| b.id()),
            rig.compositor.surface().current_buffer().map(|b| b.id())
        );
    }

    #[test]
    fn test_release_fence_attached_after_flip() {
        let mut rig = rig();
        queue_frame(&rig.queue, Fence::NO_FENCE);
        rig.compositor.run_pending();
        rig.compositor.dispatch(HandoffEvent::Vsync);
        let first_slot = rig.compositor.surface().current_slot().unwrap();

        // Second frame replaces the first, on screen and in the pool.
        queue_frame(&rig.queue, Fence::NO_FENCE);
        rig.compositor.run_pending();
        assert_ne!(rig.compositor.surface().current_slot(), Some(first_slot));

        // The first slot's release fence only signals once the second flip happens.
        let states = rig.queue.slot_states();
        assert_eq!(states[first_slot.as_usize()], SlotState::Free);
        assert!(slot_line(&rig.queue, first_slot).contains("fence=pending"));

        rig.compositor.dispatch(HandoffEvent::Vsync);
        assert!(slot_line(&rig.queue, first_slot).contains("fence=signaled"));
    }

    #[test]
    fn test_late_frame_counted() {
        let mut rig = rig();
        let gpu = SyncTimeline::new("gpu");
        queue_frame(&rig.queue, gpu.create_fence(1));
        rig.compositor.run_pending();

        rig.compositor.dispatch(HandoffEvent::Vsync);
        assert_eq!(rig.compositor.stats().late_frames, 1);
        assert_eq!(rig.compositor.stats().flips, 0);

        gpu.advance(1);
        rig.compositor.dispatch(HandoffEvent::Vsync);
        assert_eq!(rig.compositor.stats().flips, 1);
    }

    #[test]
    fn test_idle_vsync() {
        let mut rig = rig();
        rig.compositor.dispatch(HandoffEvent::Vsync);
        assert_eq!(rig.compositor.stats().idle_vsyncs, 1);
    }

    #[test]
    fn test_slot_freed_reaches_surface() {
        let mut rig = rig();
        queue_frame(&rig.queue, Fence::NO_FENCE);
        rig.compositor.run_pending();
        assert!(rig.compositor.surface().current_slot().is_some());

        rig.queue.free_all_buffers();
        rig.compositor.run_pending();
        assert_eq!(rig.compositor.surface().current_slot(), None);
        assert!(rig.compositor.stats().slots_freed >= 1);
    }

    #[test]
    fn test_late_free_notice_keeps_reused_slot() {
        let mut rig = rig_with(2, 16);
        assert_eq!(queue_frame(&rig.queue, Fence::NO_FENCE), SlotIndex::new(0));
        rig.compositor.run_pending();

        // Frame notice still in the channel when the pool frees everything
        // and the producer refills slot 0.
        queue_frame(&rig.queue, Fence::NO_FENCE);
        rig.queue.free_all_buffers();
        assert_eq!(queue_frame(&rig.queue, Fence::NO_FENCE), SlotIndex::new(0));

        rig.compositor.run_pending();
        assert_eq!(rig.compositor.surface().current_slot(), Some(SlotIndex::new(0)));
        assert_single_current(&rig);

        for _ in 0..4 {
            queue_frame(&rig.queue, Fence::NO_FENCE);
            rig.compositor.run_pending();
            assert_single_current(&rig);
        }
        assert_eq!(rig.compositor.stats().errors, 0);
    }

    #[test]
    fn test_dropped_frame_notice_is_recovered() {
        let mut rig = rig_with(3, 1);
        queue_frame(&rig.queue, Fence::NO_FENCE);
        let second = queue_frame(&rig.queue, Fence::NO_FENCE);
        assert_eq!(rig.compositor.listener().missed_frame_count(), 1);

        rig.compositor.run_pending();
        assert_eq!(rig.queue.queued_count(), 0);
        assert_eq!(rig.compositor.surface().current_slot(), Some(second));
        assert_eq!(rig.compositor.stats().frames_posted, 2);
        assert_single_current(&rig);

        // Already made up for; the next notice latches one frame.
        let third = queue_frame(&rig.queue, Fence::NO_FENCE);
        rig.compositor.run_pending();
        assert_eq!(rig.compositor.surface().current_slot(), Some(third));
        assert_eq!(rig.compositor.stats().frames_posted, 3);
    }

    #[test]
    fn test_composition_complete_forwarded() {
        let mut rig = rig();
        rig.compositor.dispatch(HandoffEvent::CompositionComplete);
        assert_eq!(rig.poster.stats().compositions, 1);
    }

    #[test]
    fn test_shutdown_abandons_queue() {
        let mut rig = rig();
        let sender = rig.compositor.sender();
        sender.send(HandoffEvent::Shutdown);

        let stats = rig.compositor.run();
        assert_eq!(stats.events_processed, 1);
        assert!(rig.queue.is_abandoned());
        assert!(rig.compositor.surface().is_abandoned());
    }
}
