//! # BufferQueue
//!
//! In-memory implementation of the buffer pool.
//!
//! ## Locking
//!
//! One mutex guards the whole slot table. Listener callbacks are collected
//! while the lock is held and dispatched after it is dropped, so a listener
//! can call straight back into the queue. Consumer-side calls never produce
//! callbacks.
//!
//! ## Stale Slots
//!
//! When the queue frees a slot the consumer still holds (resize, buffer
//! count change, disconnect), the slot is marked `needs_cleanup_on_release`.
//! The consumer's next `release` of that slot reports
//! [`PoolError::StaleSlot`] instead of touching a slot that may already
//! hold a new buffer.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::{BufferAllocator, BufferHandle, BufferUsage, PixelFormat};
use crate::error::{PoolError, PoolResult};
use crate::fence::Fence;
use crate::slot::{FrameItem, SlotArray, SlotIndex, SlotState};

use super::{
    ConsumerListener, ConsumerSettings, SlotTable, MAX_ACQUIRED_BUFFERS, MIN_BUFFER_COUNT,
    NUM_BUFFER_SLOTS,
};

/// Parameters of a producer dequeue.
///
/// Zero dimensions and a missing format fall back to the consumer defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DequeueRequest {
    /// Requested width, or 0 for the default.
    pub width: u32,
    /// Requested height, or 0 for the default.
    pub height: u32,
    /// Requested format, or `None` for the default.
    pub format: Option<PixelFormat>,
    /// Producer usage bits.
    pub usage: BufferUsage,
}

impl DequeueRequest {
    /// A request for a specific size with the default format.
    #[must_use]
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }
}

/// A slot handed to the producer.
#[derive(Debug, Clone)]
pub struct DequeuedBuffer {
    /// The slot to queue back.
    pub slot: SlotIndex,
    /// The buffer to render into.
    pub buffer: BufferHandle,
    /// Release fence to wait on before writing.
    pub fence: Fence,
    /// A new buffer was allocated for this dequeue.
    pub reallocated: bool,
}

/// Notification recorded under the lock, delivered after it.
enum Notice {
    FrameAvailable,
    SlotFreed(SlotIndex),
}

struct QueueState {
    slots: SlotArray,
    /// Queued slots, oldest first.
    fifo: VecDeque<SlotIndex>,
    settings: ConsumerSettings,
    frame_counter: u64,
    abandoned: bool,
}

impl QueueState {
    /// The free slot with the oldest frame, within the active buffer count.
    fn find_free_slot(&self) -> Option<SlotIndex> {
        self.slots
            .iter()
            .take(self.settings.max_buffer_count)
            .filter(|slot| slot.state == SlotState::Free)
            .min_by_key(|slot| slot.frame_number)
            .map(|slot| slot.index)
    }

    fn free_all(&mut self, notices: &mut Vec<Notice>) {
        self.fifo.clear();
        for slot in self.slots.iter_mut() {
            if slot.free_buffer() {
                notices.push(Notice::SlotFreed(slot.index));
            }
        }
    }
}

/// Fixed-size pool of graphics buffers shared by one producer and one consumer.
pub struct BufferQueue {
    state: Mutex<QueueState>,
    /// Signaled whenever a slot may have become free.
    slot_freed: Condvar,
    allocator: Arc<dyn BufferAllocator>,
    listener: Mutex<Option<Weak<dyn ConsumerListener>>>,
}

impl BufferQueue {
    /// Creates a queue with [`NUM_BUFFER_SLOTS`] slots.
    #[must_use]
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self::with_capacity(NUM_BUFFER_SLOTS, allocator)
    }

    /// Creates a queue with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize, allocator: Arc<dyn BufferAllocator>) -> Self {
        let settings = ConsumerSettings {
            max_buffer_count: MIN_BUFFER_COUNT.min(capacity),
            ..ConsumerSettings::default()
        };
        Self {
            state: Mutex::new(QueueState {
                slots: SlotArray::new(capacity),
                fifo: VecDeque::with_capacity(capacity),
                settings,
                frame_counter: 0,
                abandoned: false,
            }),
            slot_freed: Condvar::new(),
            allocator,
            listener: Mutex::new(None),
        }
    }

    /// Registers the consumer listener. The queue keeps only a weak reference.
    pub fn set_consumer_listener<L: ConsumerListener + 'static>(&self, listener: &Arc<L>) {
        let listener: Arc<dyn ConsumerListener> = Arc::clone(listener) as Arc<dyn ConsumerListener>;
        *self.listener.lock() = Some(Arc::downgrade(&listener));
    }

    /// Number of slots in the table.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().slots.capacity()
    }

    /// Number of slots in use.
    #[must_use]
    pub fn max_buffer_count(&self) -> usize {
        self.state.lock().settings.max_buffer_count
    }

    /// Current consumer settings.
    #[must_use]
    pub fn settings(&self) -> ConsumerSettings {
        self.state.lock().settings.clone()
    }

    /// State of every slot, by index.
    #[must_use]
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.state.lock().slots.iter().map(|slot| slot.state).collect()
    }

    /// Number of slots held by the consumer.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        self.state.lock().slots.count_in(SlotState::Acquired)
    }

    /// Number of frames waiting for the consumer.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.state.lock().fifo.len()
    }

    /// Returns true once the consumer has disconnected.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    /// Changes the size used for requests that don't specify one.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.settings.default_width = width;
        state.settings.default_height = height;
    }

    /// Changes the number of slots in use. Frees every buffer.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidBufferCount`] outside `MIN_BUFFER_COUNT..=capacity`.
    pub fn set_max_buffer_count(&self, count: usize) -> PoolResult<()> {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            check_buffer_count(count, state.slots.capacity())?;
            state.settings.max_buffer_count = count;
            state.free_all(&mut notices);
        }
        self.slot_freed.notify_all();
        self.notify(notices);
        Ok(())
    }

    /// Drops every buffer, e.g. because the producer changed size.
    ///
    /// Slots still held by the consumer are marked so that their release
    /// reports [`PoolError::StaleSlot`].
    pub fn free_all_buffers(&self) {
        let mut notices = Vec::new();
        self.state.lock().free_all(&mut notices);
        tracing::debug!("freed {} buffers", notices.len());
        self.slot_freed.notify_all();
        self.notify(notices);
    }

    /// Dequeues a free slot without blocking.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoFreeSlot`] if every slot is busy, [`PoolError::Abandoned`]
    /// after disconnect, or an allocation error.
    pub fn try_dequeue_buffer(&self, request: &DequeueRequest) -> PoolResult<DequeuedBuffer> {
        self.dequeue_inner(request, None)
    }

    /// Dequeues a free slot, waiting up to `timeout` for one to be released.
    ///
    /// # Errors
    ///
    /// Same as [`BufferQueue::try_dequeue_buffer`].
    pub fn dequeue_buffer(
        &self,
        request: &DequeueRequest,
        timeout: Duration,
    ) -> PoolResult<DequeuedBuffer> {
        self.dequeue_inner(request, Some(Instant::now() + timeout))
    }

    fn dequeue_inner(
        &self,
        request: &DequeueRequest,
        deadline: Option<Instant>,
    ) -> PoolResult<DequeuedBuffer> {
        let mut notices = Vec::new();
        let dequeued = {
            let mut state = self.state.lock();
            let slot = loop {
                if state.abandoned {
                    return Err(PoolError::Abandoned);
                }
                if let Some(slot) = state.find_free_slot() {
                    break slot;
                }
                let Some(deadline) = deadline else {
                    return Err(PoolError::NoFreeSlot);
                };
                if self.slot_freed.wait_until(&mut state, deadline).timed_out() {
                    if state.abandoned {
                        return Err(PoolError::Abandoned);
                    }
                    match state.find_free_slot() {
                        Some(slot) => break slot,
                        None => return Err(PoolError::NoFreeSlot),
                    }
                }
            };

            let settings = &state.settings;
            let width = if request.width == 0 { settings.default_width } else { request.width };
            let height = if request.height == 0 { settings.default_height } else { request.height };
            let format = request.format.unwrap_or(settings.default_format);
            let usage = request.usage | settings.usage;

            let entry = state.slots.get_mut(slot)?;
            let mut reallocated = false;
            let buffer = match entry
                .buffer
                .as_ref()
                .filter(|buffer| buffer.satisfies(width, height, format, usage))
            {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    let buffer = self.allocator.allocate(width, height, format, usage)?;
                    if entry.buffer.replace(Arc::clone(&buffer)).is_some() {
                        notices.push(Notice::SlotFreed(slot));
                    }
                    reallocated = true;
                    buffer
                }
            };

            entry.state = SlotState::Dequeued;
            DequeuedBuffer {
                slot,
                buffer,
                fence: std::mem::take(&mut entry.fence),
                reallocated,
            }
        };

        if dequeued.reallocated {
            tracing::trace!(
                "slot {} reallocated: {}x{} {}",
                dequeued.slot,
                dequeued.buffer.width(),
                dequeued.buffer.height(),
                dequeued.buffer.format()
            );
        }
        self.notify(notices);
        Ok(dequeued)
    }

    /// Hands a filled slot to the consumer.
    ///
    /// In asynchronous mode any frame still waiting is dropped in favour of
    /// this one.
    ///
    /// # Errors
    ///
    /// [`PoolError::WrongState`] unless the slot is dequeued,
    /// [`PoolError::Abandoned`] after disconnect.
    pub fn queue_buffer(&self, slot: SlotIndex, acquire_fence: Fence) -> PoolResult<u64> {
        let frame_number = {
            let mut state = self.state.lock();
            if state.abandoned {
                return Err(PoolError::Abandoned);
            }
            let current = state.slots.get(slot)?.state;
            if current != SlotState::Dequeued {
                return Err(PoolError::WrongState { slot, state: current });
            }

            if !state.settings.synchronous {
                while let Some(dropped) = state.fifo.pop_front() {
                    let entry = state.slots.get_mut(dropped)?;
                    entry.state = SlotState::Free;
                    entry.fence = std::mem::take(&mut entry.acquire_fence);
                    tracing::trace!("dropped frame {} in slot {}", entry.frame_number, dropped);
                }
                self.slot_freed.notify_all();
            }

            state.frame_counter += 1;
            let frame_number = state.frame_counter;
            let entry = state.slots.get_mut(slot)?;
            entry.state = SlotState::Queued;
            entry.acquire_fence = acquire_fence;
            entry.frame_number = frame_number;
            state.fifo.push_back(slot);
            frame_number
        };

        self.notify(vec![Notice::FrameAvailable]);
        Ok(frame_number)
    }

    /// Returns a dequeued slot without queuing it.
    ///
    /// # Errors
    ///
    /// [`PoolError::WrongState`] unless the slot is dequeued.
    pub fn cancel_buffer(&self, slot: SlotIndex, fence: Fence) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            let entry = state.slots.get_mut(slot)?;
            if entry.state != SlotState::Dequeued {
                return Err(PoolError::WrongState {
                    slot,
                    state: entry.state,
                });
            }
            entry.state = SlotState::Free;
            entry.fence = fence;
        }
        self.slot_freed.notify_all();
        Ok(())
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        let Some(listener) = listener else {
            return;
        };
        for notice in notices {
            match notice {
                Notice::FrameAvailable => listener.on_frame_available(),
                Notice::SlotFreed(slot) => listener.on_slot_freed(slot),
            }
        }
    }
}

fn check_buffer_count(count: usize, capacity: usize) -> PoolResult<()> {
    if (MIN_BUFFER_COUNT..=capacity).contains(&count) {
        Ok(())
    } else {
        Err(PoolError::InvalidBufferCount {
            requested: count,
            min: MIN_BUFFER_COUNT,
            max: capacity,
        })
    }
}

impl SlotTable for BufferQueue {
    fn configure(&self, settings: &ConsumerSettings) -> PoolResult<()> {
        let mut notices = Vec::new();
        {
            let mut state = self.state.lock();
            if state.abandoned {
                return Err(PoolError::Abandoned);
            }
            check_buffer_count(settings.max_buffer_count, state.slots.capacity())?;
            if settings.max_buffer_count != state.settings.max_buffer_count {
                state.free_all(&mut notices);
            }
            state.settings = settings.clone();
        }
        tracing::debug!(
            "consumer '{}' configured: {}x{} {}, {} buffers",
            settings.name,
            settings.default_width,
            settings.default_height,
            settings.default_format,
            settings.max_buffer_count
        );
        self.slot_freed.notify_all();
        self.notify(notices);
        Ok(())
    }

    fn acquire_next(&self) -> PoolResult<FrameItem> {
        let mut state = self.state.lock();
        if state.abandoned {
            return Err(PoolError::Abandoned);
        }
        if state.slots.count_in(SlotState::Acquired) > MAX_ACQUIRED_BUFFERS {
            return Err(PoolError::TooManyAcquired {
                max: MAX_ACQUIRED_BUFFERS,
            });
        }
        let Some(slot) = state.fifo.pop_front() else {
            return Err(PoolError::NoBufferAvailable);
        };

        let entry = state.slots.get_mut(slot)?;
        entry.state = SlotState::Acquired;
        // A fresh acquire supersedes any reference the consumer held before
        // the slot was freed.
        entry.needs_cleanup_on_release = false;
        Ok(FrameItem {
            slot,
            acquire_fence: std::mem::take(&mut entry.acquire_fence),
            frame_number: entry.frame_number,
        })
    }

    fn release(&self, slot: SlotIndex, fence: Fence) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            let entry = state.slots.get_mut(slot)?;
            match entry.state {
                SlotState::Acquired => {
                    entry.state = SlotState::Free;
                    entry.fence = Fence::merge(&entry.fence, &fence);
                }
                _ if entry.needs_cleanup_on_release => {
                    entry.needs_cleanup_on_release = false;
                    return Err(PoolError::StaleSlot(slot));
                }
                other => return Err(PoolError::WrongState { slot, state: other }),
            }
        }
        self.slot_freed.notify_all();
        Ok(())
    }

    fn add_release_fence(&self, slot: SlotIndex, fence: Fence) -> PoolResult<()> {
        let mut state = self.state.lock();
        let entry = state.slots.get_mut(slot)?;
        entry.fence = Fence::merge(&entry.fence, &fence);
        Ok(())
    }

    fn buffer(&self, slot: SlotIndex) -> Option<BufferHandle> {
        self.state.lock().slots.get(slot).ok()?.buffer.clone()
    }

    fn disconnect(&self) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            if state.abandoned {
                return Err(PoolError::Abandoned);
            }
            state.abandoned = true;
            // The consumer is going away; nobody needs to hear about these.
            let mut discarded = Vec::new();
            state.free_all(&mut discarded);
        }
        *self.listener.lock() = None;
        self.slot_freed.notify_all();
        tracing::debug!("consumer disconnected, buffer queue abandoned");
        Ok(())
    }

    fn dump(&self, out: &mut String, prefix: &str) {
        let state = self.state.lock();
        let settings = &state.settings;
        let queued: Vec<String> = state.fifo.iter().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "{prefix}BufferQueue '{}': default={}x{} {}, usage={:?}, max_buffer_count={}, synchronous={}, abandoned={}, queued=[{}]",
            settings.name,
            settings.default_width,
            settings.default_height,
            settings.default_format,
            settings.usage,
            settings.max_buffer_count,
            settings.synchronous,
            state.abandoned,
            queued.join(", "),
        );
        for slot in state.slots.iter().take(settings.max_buffer_count) {
            let _ = write!(
                out,
                "{prefix}  [{:02}] state={:<8} frame={} fence={}",
                slot.index.as_usize(),
                slot.state.to_string(),
                slot.frame_number,
                slot.fence,
            );
            match &slot.buffer {
                Some(buffer) => {
                    let _ = writeln!(
                        out,
                        " buffer={} {}x{} stride={} {}",
                        buffer.id(),
                        buffer.width(),
                        buffer.height(),
                        buffer.stride(),
                        buffer.format()
                    );
                }
                None => {
                    let _ = writeln!(out, " buffer=none");
                }
            }
        }
    }
}
