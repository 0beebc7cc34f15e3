//! # Frame Producer
//!
//! A stand-in renderer. Each frame it dequeues a slot, waits for the
//! slot's release fence, "renders" (stamps an acquire fence on its own
//! timeline) and queues the slot back. The acquire fence signals right
//! after the queue, the way a GPU finishes after submission.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use framelatch_core::{
    BufferId, BufferQueue, DequeueRequest, Fence, FenceError, PoolError, SlotIndex, SyncTimeline,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the frame producer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    /// The buffer queue refused a dequeue or queue.
    #[error("buffer queue error: {0}")]
    Pool(#[from] PoolError),

    /// A release fence never signaled.
    #[error("release fence wait failed: {0}")]
    Fence(#[from] FenceError),
}

/// Settings for the demo producer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerConfig {
    /// Frames to produce before stopping.
    pub frames: u64,
    /// Free all buffers and toggle the size every this many frames (0 = never).
    pub resize_every: u64,
    /// Pause between frames, in microseconds.
    pub frame_interval_us: u64,
    /// How long to wait for a free slot, in milliseconds.
    pub dequeue_timeout_ms: u64,
    /// How long to wait for a release fence, in milliseconds.
    pub fence_timeout_ms: u64,
    /// Give up after this many failed frames in a row.
    pub max_consecutive_failures: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            resize_every: 0,
            frame_interval_us: 16_666,
            dequeue_timeout_ms: 100,
            fence_timeout_ms: 100,
            max_consecutive_failures: 10,
        }
    }
}

/// One frame handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducedFrame {
    /// Slot the frame went into.
    pub slot: SlotIndex,
    /// Buffer that was rendered.
    pub buffer: BufferId,
    /// Frame number assigned by the queue.
    pub frame_number: u64,
    /// The dequeue allocated a new buffer.
    pub reallocated: bool,
}

/// Outcome of [`FrameProducer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerRun {
    /// Frames queued during the run.
    pub frames: u64,
    /// Frames that failed and were skipped.
    pub failures: u64,
    /// The consumer disconnected before all frames were produced.
    pub abandoned: bool,
}

/// Renders into a [`BufferQueue`].
pub struct FrameProducer {
    queue: Arc<BufferQueue>,
    timeline: SyncTimeline,
    request: DequeueRequest,
    dequeue_timeout: Duration,
    fence_timeout: Duration,
    frames_produced: u64,
}

impl FrameProducer {
    /// Creates a producer using the queue's default buffer size.
    #[must_use]
    pub fn new(queue: Arc<BufferQueue>, config: &ProducerConfig) -> Self {
        Self {
            queue,
            timeline: SyncTimeline::new("producer"),
            request: DequeueRequest::default(),
            dequeue_timeout: Duration::from_millis(config.dequeue_timeout_ms),
            fence_timeout: Duration::from_millis(config.fence_timeout_ms),
            frames_produced: 0,
        }
    }

    /// Frames queued so far.
    #[inline]
    #[must_use]
    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    /// The timeline acquire fences are created on.
    #[must_use]
    pub fn timeline(&self) -> &SyncTimeline {
        &self.timeline
    }

    /// Renders and queues one frame.
    ///
    /// # Errors
    ///
    /// Dequeue/queue failures (including [`PoolError::Abandoned`] once the
    /// consumer is gone) and release fence timeouts. A slot whose release
    /// fence times out is cancelled back to the queue.
    pub fn produce_frame(&mut self) -> Result<ProducedFrame, ProducerError> {
        let dequeued = self.queue.dequeue_buffer(&self.request, self.dequeue_timeout)?;

        if let Err(err) = dequeued.fence.wait(self.fence_timeout) {
            self.queue.cancel_buffer(dequeued.slot, dequeued.fence)?;
            return Err(err.into());
        }

        let point = self.frames_produced + 1;
        let acquire_fence = self.timeline.create_fence(point);
        let frame_number = self.queue.queue_buffer(dequeued.slot, acquire_fence)?;
        self.timeline.signal_to(point);
        self.frames_produced = point;

        tracing::trace!(
            "queued frame {} into slot {} ({})",
            frame_number,
            dequeued.slot,
            dequeued.buffer.id()
        );
        Ok(ProducedFrame {
            slot: dequeued.slot,
            buffer: dequeued.buffer.id(),
            frame_number,
            reallocated: dequeued.reallocated,
        })
    }

    /// Switches to a new buffer size.
    ///
    /// Every buffer is dropped at once, including the one on screen, so the
    /// consumer sees its current slot freed.
    pub fn resize(&mut self, width: u32, height: u32) {
        tracing::info!("producer resizing to {}x{}", width, height);
        self.request = DequeueRequest::sized(width, height);
        self.queue.free_all_buffers();
    }

    /// Produces frames until `config.frames` have been queued.
    ///
    /// Every `resize_every` frames the buffer size toggles between
    /// `full_size` and half of it. `on_frame` sees each queued frame.
    /// Stops early, without error, once the queue is abandoned.
    ///
    /// # Errors
    ///
    /// The last failure, once `max_consecutive_failures` frames in a row
    /// have failed.
    pub fn run(
        &mut self,
        config: &ProducerConfig,
        full_size: (u32, u32),
        mut on_frame: impl FnMut(&ProducedFrame),
    ) -> Result<ProducerRun, ProducerError> {
        let interval = Duration::from_micros(config.frame_interval_us);
        let mut run = ProducerRun::default();
        let mut consecutive_failures = 0;
        let mut half_size = false;
        let mut last_resize = 0;

        while self.frames_produced < config.frames {
            let produced = self.frames_produced;
            if config.resize_every > 0
                && produced > 0
                && produced % config.resize_every == 0
                && produced != last_resize
            {
                half_size = !half_size;
                last_resize = produced;
                let (width, height) = if half_size {
                    ((full_size.0 / 2).max(1), (full_size.1 / 2).max(1))
                } else {
                    full_size
                };
                self.resize(width, height);
            }

            match self.produce_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    run.frames += 1;
                    on_frame(&frame);
                }
                Err(ProducerError::Pool(PoolError::Abandoned)) => {
                    tracing::warn!("queue abandoned after {} frames, producer stopping", run.frames);
                    run.abandoned = true;
                    break;
                }
                Err(err) => {
                    run.failures += 1;
                    consecutive_failures += 1;
                    if consecutive_failures >= config.max_consecutive_failures {
                        tracing::error!(
                            "producer giving up after {} failed frames: {}",
                            consecutive_failures,
                            err
                        );
                        return Err(err);
                    }
                    tracing::debug!("frame dropped: {}", err);
                }
            }

            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        Ok(run)
    }

    /// Queues a frame without waiting for anything, for tests that need
    /// a fence the consumer has to wait on.
    ///
    /// # Errors
    ///
    /// Dequeue/queue failures.
    pub fn queue_with_fence(&mut self, fence: Fence) -> Result<ProducedFrame, ProducerError> {
        let dequeued = self.queue.try_dequeue_buffer(&self.request)?;
        let frame_number = self.queue.queue_buffer(dequeued.slot, fence)?;
        self.frames_produced += 1;
        Ok(ProducedFrame {
            slot: dequeued.slot,
            buffer: dequeued.buffer.id(),
            frame_number,
            reallocated: dequeued.reallocated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelatch_core::{ConsumerSettings, HeapAllocator, SlotTable};

    fn queue() -> Arc<BufferQueue> {
        let queue = Arc::new(BufferQueue::with_capacity(4, Arc::new(HeapAllocator::new())));
        queue
            .configure(&ConsumerSettings {
                default_width: 16,
                default_height: 16,
                max_buffer_count: 2,
                ..ConsumerSettings::default()
            })
            .unwrap();
        queue
    }

    fn config() -> ProducerConfig {
        ProducerConfig {
            frame_interval_us: 0,
            dequeue_timeout_ms: 5,
            fence_timeout_ms: 5,
            ..ProducerConfig::default()
        }
    }

    #[test]
    fn test_frames_are_numbered_and_signaled() {
        let queue = queue();
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config());

        let first = producer.produce_frame().unwrap();
        assert_eq!(first.frame_number, 1);
        assert!(first.reallocated);

        let item = queue.acquire_next().unwrap();
        assert_eq!(item.slot, first.slot);
        assert!(item.acquire_fence.is_signaled());
        assert_eq!(producer.frames_produced(), 1);
        assert_eq!(producer.timeline().value(), 1);
    }

    #[test]
    fn test_pending_release_fence_cancels_slot() {
        let queue = queue();
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config());
        let display = SyncTimeline::new("display");

        // Both slots go through the consumer and come back with a pending fence.
        for _ in 0..2 {
            producer.produce_frame().unwrap();
            let item = queue.acquire_next().unwrap();
            queue.release(item.slot, display.create_fence(1)).unwrap();
        }

        let err = producer.produce_frame().unwrap_err();
        assert_eq!(err, ProducerError::Fence(FenceError::Timeout(Duration::from_millis(5))));
        assert_eq!(queue.queued_count(), 0);

        display.advance(1);
        assert!(producer.produce_frame().is_ok());
    }

    #[test]
    fn test_full_queue_times_out() {
        let queue = queue();
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config());
        producer.produce_frame().unwrap();
        producer.produce_frame().unwrap();

        assert_eq!(
            producer.produce_frame().unwrap_err(),
            ProducerError::Pool(PoolError::NoFreeSlot)
        );
    }

    #[test]
    fn test_resize_reallocates() {
        let queue = queue();
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config());
        let before = producer.produce_frame().unwrap();

        producer.resize(8, 8);
        let after = producer.produce_frame().unwrap();
        assert!(after.reallocated);
        assert_ne!(after.buffer, before.buffer);
        assert_eq!(queue.buffer(after.slot).unwrap().width(), 8);
    }

    #[test]
    fn test_run_gives_up_when_nothing_is_consumed() {
        let queue = queue();
        let config = ProducerConfig {
            frames: 10,
            max_consecutive_failures: 3,
            ..config()
        };
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config);

        let err = producer.run(&config, (16, 16), |_| {}).unwrap_err();
        assert_eq!(err, ProducerError::Pool(PoolError::NoFreeSlot));
        assert_eq!(producer.frames_produced(), 2);
    }

    #[test]
    fn test_run_stops_when_abandoned() {
        let queue = queue();
        queue.disconnect().unwrap();
        let config = ProducerConfig {
            frames: 10,
            ..config()
        };
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config);

        let run = producer.run(&config, (16, 16), |_| {}).unwrap();
        assert!(run.abandoned);
        assert_eq!(run.frames, 0);
    }

    #[test]
    fn test_run_toggles_size() {
        let queue = queue();
        let config = ProducerConfig {
            frames: 7,
            resize_every: 3,
            ..config()
        };
        let mut producer = FrameProducer::new(Arc::clone(&queue), &config);
        let mut widths = Vec::new();

        let run = producer
            .run(&config, (16, 16), |frame| {
                widths.push(queue.buffer(frame.slot).unwrap().width());
                let item = queue.acquire_next().unwrap();
                queue.release(item.slot, Fence::NO_FENCE).unwrap();
            })
            .unwrap();

        assert_eq!(run, ProducerRun { frames: 7, failures: 0, abandoned: false });
        assert_eq!(widths, vec![16, 16, 16, 8, 8, 8, 16]);
    }
}
