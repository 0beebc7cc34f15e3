//! # Slot Table
//!
//! Fixed-capacity array of buffer slots. Slots are created once, when the
//! queue is built, and reused for the life of the queue. The buffer inside a
//! slot may be replaced at any time by the queue; the slot index never
//! changes.
//!
//! ## Slot Lifecycle
//!
//! ```text
//!            dequeue            queue             acquire
//!   FREE ─────────────> DEQUEUED ─────> QUEUED ─────────────> ACQUIRED
//!    ▲                     │                                     │
//!    │       cancel        │                                     │
//!    ├─────────────────────┘                                     │
//!    │                         release                           │
//!    └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The consumer's latched `ACQUIRED` slot is the one currently on display.

use std::fmt;

use crate::buffer::BufferHandle;
use crate::error::{PoolError, PoolResult};
use crate::fence::Fence;

/// Stable index of a slot, `0..capacity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Creates a slot index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index as a `usize` for table lookups.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who owns a slot right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SlotState {
    /// Owned by the queue; the producer may dequeue it.
    #[default]
    Free,
    /// Owned by the producer, being filled.
    Dequeued,
    /// Filled and waiting for the consumer.
    Queued,
    /// Owned by the consumer.
    Acquired,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "FREE",
            Self::Dequeued => "DEQUEUED",
            Self::Queued => "QUEUED",
            Self::Acquired => "ACQUIRED",
        };
        f.write_str(name)
    }
}

/// One entry of the slot table.
#[derive(Debug)]
pub struct BufferSlot {
    /// Stable index.
    pub index: SlotIndex,
    /// Buffer currently stored in the slot, if any.
    pub buffer: Option<BufferHandle>,
    /// Lifecycle state.
    pub state: SlotState,
    /// Release fence the producer waits on before writing.
    pub fence: Fence,
    /// Fence attached by the producer when the slot was queued.
    pub acquire_fence: Fence,
    /// Frame number of the last queue into this slot.
    pub frame_number: u64,
    /// The queue freed this slot while the consumer still held it.
    pub needs_cleanup_on_release: bool,
}

impl BufferSlot {
    fn new(index: SlotIndex) -> Self {
        Self {
            index,
            buffer: None,
            state: SlotState::Free,
            fence: Fence::NO_FENCE,
            acquire_fence: Fence::NO_FENCE,
            frame_number: 0,
            needs_cleanup_on_release: false,
        }
    }

    /// Drops the buffer and returns the slot to `Free`.
    ///
    /// Returns true if a buffer was dropped.
    pub fn free_buffer(&mut self) -> bool {
        if self.state == SlotState::Acquired {
            self.needs_cleanup_on_release = true;
        }
        self.state = SlotState::Free;
        self.fence = Fence::NO_FENCE;
        self.acquire_fence = Fence::NO_FENCE;
        self.frame_number = 0;
        self.buffer.take().is_some()
    }
}

/// An item handed to the consumer by `acquire_next`.
#[derive(Debug, Clone)]
pub struct FrameItem {
    /// The slot holding the frame.
    pub slot: SlotIndex,
    /// Fence the display must wait on before reading the buffer.
    pub acquire_fence: Fence,
    /// Frame number assigned at queue time.
    pub frame_number: u64,
}

/// Fixed-capacity slot storage.
///
/// All slots exist from construction; nothing is allocated or freed
/// afterwards. Not thread-safe by itself, the queue wraps it in its lock.
pub struct SlotArray {
    storage: Box<[BufferSlot]>,
}

impl SlotArray {
    /// Creates `capacity` free, empty slots.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero or does not fit a `u32`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");
        let count = u32::try_from(capacity).expect("slot capacity must fit in u32");

        let storage: Vec<BufferSlot> = (0..count).map(|i| BufferSlot::new(SlotIndex(i))).collect();
        Self {
            storage: storage.into_boxed_slice(),
        }
    }

    /// Returns the number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Gets a slot.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSlot`] for an out-of-range index.
    #[inline]
    pub fn get(&self, slot: SlotIndex) -> PoolResult<&BufferSlot> {
        let capacity = self.capacity();
        self.storage
            .get(slot.as_usize())
            .ok_or(PoolError::InvalidSlot { slot, capacity })
    }

    /// Gets a slot mutably.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSlot`] for an out-of-range index.
    #[inline]
    pub fn get_mut(&mut self, slot: SlotIndex) -> PoolResult<&mut BufferSlot> {
        let capacity = self.capacity();
        self.storage
            .get_mut(slot.as_usize())
            .ok_or(PoolError::InvalidSlot { slot, capacity })
    }

    /// Number of slots in `state`.
    #[must_use]
    pub fn count_in(&self, state: SlotState) -> usize {
        self.storage.iter().filter(|s| s.state == state).count()
    }

    /// Iterates over all slots.
    pub fn iter(&self) -> impl Iterator<Item = &BufferSlot> {
        self.storage.iter()
    }

    /// Iterates mutably over all slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferSlot> {
        self.storage.iter_mut()
    }
}
