//! # Core Error Types
//!
//! Errors reported by the buffer queue and by fences.

use std::time::Duration;

use thiserror::Error;

use crate::slot::{SlotIndex, SlotState};

/// Errors that can occur in the buffer queue.
///
/// `NoBufferAvailable` and `StaleSlot` are expected outcomes of the
/// hand-off protocol, not failures. Use [`PoolError::is_recoverable`] to
/// tell them apart from real errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No queued item is ready for the consumer.
    #[error("no buffer available")]
    NoBufferAvailable,

    /// The slot was freed and possibly reallocated since the caller last saw it.
    #[error("slot {0} is stale")]
    StaleSlot(SlotIndex),

    /// Slot index outside the table.
    #[error("slot {slot} out of range (capacity {capacity})")]
    InvalidSlot {
        /// The offending index.
        slot: SlotIndex,
        /// Number of slots in the table.
        capacity: usize,
    },

    /// The slot is not in the state the operation requires.
    #[error("slot {slot} is {state}")]
    WrongState {
        /// The slot that was touched.
        slot: SlotIndex,
        /// The state it was actually in.
        state: SlotState,
    },

    /// Every usable slot is owned by the producer or the consumer.
    #[error("no free slot available")]
    NoFreeSlot,

    /// The consumer already holds as many buffers as the queue allows.
    #[error("too many buffers acquired (max {max})")]
    TooManyAcquired {
        /// Maximum number of simultaneously acquired buffers.
        max: usize,
    },

    /// Requested buffer count outside the supported range.
    #[error("buffer count {requested} outside {min}..={max}")]
    InvalidBufferCount {
        /// The requested count.
        requested: usize,
        /// Smallest accepted count.
        min: usize,
        /// Largest accepted count.
        max: usize,
    },

    /// The allocator could not produce a buffer.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// The consumer disconnected; the queue no longer hands out buffers.
    #[error("buffer queue has been abandoned")]
    Abandoned,
}

impl PoolError {
    /// Returns true for outcomes the hand-off protocol treats as success.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoBufferAvailable | Self::StaleSlot(_))
    }
}

/// Result type for buffer queue operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while waiting on a fence.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceError {
    /// The fence did not signal within the allotted time.
    #[error("fence wait timed out after {0:?}")]
    Timeout(Duration),
}
