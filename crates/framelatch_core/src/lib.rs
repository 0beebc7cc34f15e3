//! # FRAMELATCH Core
//!
//! The data model shared by producers, the buffer queue and the display
//! hand-off surface:
//! - Fixed-capacity slot table, created once and reused forever
//! - Software sync timelines and fences
//! - Graphics buffer handles and allocators
//! - [`BufferQueue`], the pool that moves buffers between one producer and
//!   one consumer
//!
//! ## Rules
//!
//! 1. **Slots never move** - a [`SlotIndex`] is valid for the life of the queue
//! 2. **Buffers do** - the buffer inside a slot may be replaced at any time
//! 3. **No callbacks under lock** - listeners run after the queue lock is dropped
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use framelatch_core::{BufferQueue, DequeueRequest, Fence, HeapAllocator, SlotTable};
//!
//! let queue = BufferQueue::new(Arc::new(HeapAllocator::new()));
//! queue.set_default_buffer_size(320, 240);
//!
//! let dequeued = queue.try_dequeue_buffer(&DequeueRequest::default()).unwrap();
//! queue.queue_buffer(dequeued.slot, Fence::NO_FENCE).unwrap();
//!
//! let item = queue.acquire_next().unwrap();
//! assert_eq!(item.slot, dequeued.slot);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod buffer;
pub mod error;
pub mod fence;
pub mod queue;
pub mod slot;

pub use buffer::{
    BufferAllocator, BufferHandle, BufferId, BufferUsage, GraphicBuffer, HeapAllocator,
    PixelFormat,
};
pub use error::{FenceError, PoolError, PoolResult};
pub use fence::{Fence, SyncHandle, SyncTimeline};
pub use queue::{
    BufferQueue, ConsumerListener, ConsumerSettings, DequeueRequest, DequeuedBuffer, SlotTable,
    MAX_ACQUIRED_BUFFERS, MIN_BUFFER_COUNT, NUM_BUFFER_SLOTS,
};
pub use slot::{BufferSlot, FrameItem, SlotArray, SlotIndex, SlotState};
