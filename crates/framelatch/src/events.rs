//! # FRAMELATCH Event Bus
//!
//! Turns pool notifications into messages for the compositor thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  on_frame_available  ┌─────────────┐  HandoffEvent  ┌─────────────┐
//! │ BufferQueue │─────────────────────>│ EventSender │───────────────>│ Compositor  │
//! │ (producer   │  on_slot_freed       │ (listener)  │   bounded      │ (one thread)│
//! │  thread)    │─────────────────────>│             │   channel      │             │
//! └─────────────┘                      └─────────────┘                └─────────────┘
//!                                             ▲
//!                    Vsync / CompositionComplete / Shutdown
//!                                             │
//!                                    display + renderer
//! ```
//!
//! The queue calls its listener from whichever thread touched it. Routing
//! everything through one channel means the surface only ever runs on the
//! compositor thread, in notification order.
//!
//! A full channel drops `FrameAvailable` notices. Each one stands for a
//! queued frame, so the senders count them separately and the compositor
//! latches that many extra frames on its next chance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use framelatch_core::{ConsumerListener, SlotIndex};

/// Messages processed by the compositor loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffEvent {
    /// The producer queued a frame.
    FrameAvailable,
    /// The pool discarded the buffer in a slot.
    SlotFreed(SlotIndex),
    /// The display is ready to flip.
    Vsync,
    /// The renderer finished composing the frame.
    CompositionComplete,
    /// Stop the compositor loop.
    Shutdown,
}

/// Bounded channel carrying [`HandoffEvent`]s.
pub struct EventBus {
    sender: Sender<HandoffEvent>,
    receiver: Receiver<HandoffEvent>,
    dropped: Arc<AtomicU64>,
    missed_frames: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a new event bus.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum events in flight. Should comfortably exceed
    ///   twice the buffer count, so notifications are never dropped.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            dropped: Arc::new(AtomicU64::new(0)),
            missed_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a sender handle.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
            missed_frames: Arc::clone(&self.missed_frames),
        }
    }

    /// Creates a receiver handle.
    #[must_use]
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.receiver.clone(),
        }
    }

    /// Creates a new pair of sender and receiver.
    #[must_use]
    pub fn create_pair(capacity: usize) -> (EventSender, EventReceiver) {
        let bus = Self::new(capacity);
        (bus.sender(), bus.receiver())
    }
}

/// Handle for sending events.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<HandoffEvent>,
    dropped: Arc<AtomicU64>,
    missed_frames: Arc<AtomicU64>,
}

impl EventSender {
    /// Sends an event (non-blocking).
    ///
    /// Returns `false` if the channel is full or closed; the event is dropped.
    #[inline]
    pub fn send(&self, event: HandoffEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if event == HandoffEvent::FrameAvailable {
                    self.missed_frames.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!("event bus full, dropped {:?}", event);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Sends an event, waiting for room if the channel is full.
    ///
    /// Use only for events that must not be lost.
    #[inline]
    pub fn send_blocking(&self, event: HandoffEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Number of events dropped because the channel was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of dropped [`HandoffEvent::FrameAvailable`] notices.
    #[must_use]
    pub fn missed_frame_count(&self) -> u64 {
        self.missed_frames.load(Ordering::Relaxed)
    }
}

impl ConsumerListener for EventSender {
    fn on_frame_available(&self) {
        self.send(HandoffEvent::FrameAvailable);
    }

    fn on_slot_freed(&self, slot: SlotIndex) {
        // A lost free would leave the surface holding a dead buffer.
        self.send_blocking(HandoffEvent::SlotFreed(slot));
    }
}

/// Handle for receiving events.
#[derive(Clone)]
pub struct EventReceiver {
    receiver: Receiver<HandoffEvent>,
}

impl EventReceiver {
    /// Receives all pending events (non-blocking).
    #[inline]
    pub fn drain(&self) -> Vec<HandoffEvent> {
        let mut events = Vec::with_capacity(16);
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Receives one event (non-blocking).
    #[inline]
    pub fn try_recv(&self) -> Option<HandoffEvent> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for one event.
    ///
    /// Returns `None` on timeout. A closed channel reads as
    /// [`HandoffEvent::Shutdown`].
    pub fn recv_timeout(&self, timeout: Duration) -> Option<HandoffEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(HandoffEvent::Shutdown),
        }
    }

    /// Waits for one event. A closed channel reads as [`HandoffEvent::Shutdown`].
    pub fn recv(&self) -> HandoffEvent {
        self.receiver.recv().unwrap_or(HandoffEvent::Shutdown)
    }

    /// Returns the number of pending events.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Checks if there are pending events.
    #[inline]
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.receiver.is_empty()
    }
}
