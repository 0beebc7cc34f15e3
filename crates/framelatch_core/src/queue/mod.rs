//! # Buffer Queue
//!
//! The pool that sits between a producer (a renderer) and a consumer (the
//! display hand-off surface).
//!
//! ```text
//!  ┌──────────┐  dequeue / queue   ┌─────────────┐  acquire / release  ┌──────────┐
//!  │ Producer │ ─────────────────> │ BufferQueue │ <────────────────── │ Consumer │
//!  └──────────┘                    └──────┬──────┘                     └────▲─────┘
//!                                         │  on_frame_available / on_slot_freed
//!                                         └───────────────────────────────────┘
//! ```
//!
//! The consumer only sees the queue through [`SlotTable`], so tests and
//! other pools can stand in for [`BufferQueue`].

mod buffer_queue;

pub use buffer_queue::{BufferQueue, DequeueRequest, DequeuedBuffer};

use crate::buffer::{BufferHandle, BufferUsage, PixelFormat};
use crate::error::PoolResult;
use crate::fence::Fence;
use crate::slot::{FrameItem, SlotIndex};

/// Total number of slots in a queue built with [`BufferQueue::new`].
pub const NUM_BUFFER_SLOTS: usize = 32;

/// Buffers the consumer may hold while it acquires the next one.
pub const MAX_ACQUIRED_BUFFERS: usize = 1;

/// Smallest buffer count that lets the producer fill one buffer while the
/// consumer displays another.
pub const MIN_BUFFER_COUNT: usize = 2;

/// Consumer-side configuration pushed into the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Consumer name used in logs and dumps.
    pub name: String,
    /// Usage bits OR-ed into every allocation.
    pub usage: BufferUsage,
    /// Format used when the producer doesn't ask for one.
    pub default_format: PixelFormat,
    /// Width used when the producer asks for zero.
    pub default_width: u32,
    /// Height used when the producer asks for zero.
    pub default_height: u32,
    /// Number of slots in use.
    pub max_buffer_count: usize,
    /// Keep every queued frame (`true`) or only the newest (`false`).
    pub synchronous: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: String::from("unnamed-consumer"),
            usage: BufferUsage::empty(),
            default_format: PixelFormat::Rgba8888,
            default_width: 1,
            default_height: 1,
            max_buffer_count: MIN_BUFFER_COUNT,
            synchronous: true,
        }
    }
}

/// The consumer's view of a buffer pool.
///
/// None of these methods call back into a [`ConsumerListener`], so a
/// consumer may call them while holding its own lock.
pub trait SlotTable: Send + Sync {
    /// Applies consumer configuration.
    ///
    /// # Errors
    ///
    /// Fails if the settings can't be honoured (e.g. buffer count out of range).
    fn configure(&self, settings: &ConsumerSettings) -> PoolResult<()>;

    /// Takes ownership of the oldest queued frame.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoBufferAvailable`](crate::PoolError::NoBufferAvailable)
    /// when nothing is queued; this is not a failure.
    fn acquire_next(&self) -> PoolResult<FrameItem>;

    /// Returns a slot to the pool with a release fence.
    ///
    /// # Errors
    ///
    /// [`PoolError::StaleSlot`](crate::PoolError::StaleSlot) if the slot was
    /// freed since it was acquired; this is not a failure.
    fn release(&self, slot: SlotIndex, fence: Fence) -> PoolResult<()>;

    /// Merges a release fence into a slot without releasing it.
    ///
    /// # Errors
    ///
    /// Fails for an invalid slot.
    fn add_release_fence(&self, slot: SlotIndex, fence: Fence) -> PoolResult<()>;

    /// Returns the buffer stored in a slot.
    fn buffer(&self, slot: SlotIndex) -> Option<BufferHandle>;

    /// Disconnects the consumer. The pool stops handing out frames.
    ///
    /// # Errors
    ///
    /// Fails if the pool was already abandoned.
    fn disconnect(&self) -> PoolResult<()>;

    /// Appends a text snapshot of the pool to `out`.
    fn dump(&self, _out: &mut String, _prefix: &str) {}
}

/// Notifications the pool sends to its consumer.
///
/// Always invoked without any pool lock held.
pub trait ConsumerListener: Send + Sync {
    /// A frame was queued.
    fn on_frame_available(&self);

    /// The buffer in `slot` was discarded or is about to be replaced.
    fn on_slot_freed(&self, slot: SlotIndex);
}
