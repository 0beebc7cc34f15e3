//! # Fences and Sync Timelines
//!
//! A [`Fence`] marks a point in producer or consumer execution after which a
//! buffer is safe to read (acquire fence) or safe to overwrite (release
//! fence). Fences are handles: the queue and the hand-off surface only pass
//! them along. Whoever actually touches the pixels (the producer before
//! writing, the display before scanning out) is the one that waits.
//!
//! ```text
//!   SyncTimeline "gpu"        value: 0 ──advance──> 1 ──advance──> 2
//!                                         │                  │
//!   Fence { gpu@1 }  ───────────── signaled                  │
//!   Fence { gpu@2 }  ──────────────────────────────── signaled
//! ```
//!
//! Timelines here are software counters. A driver-backed implementation
//! would wrap its own sync object behind [`SyncHandle`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FenceError;

/// Shared state of one timeline.
struct TimelineShared {
    name: String,
    value: Mutex<u64>,
    signaled: Condvar,
}

/// A monotonically increasing counter that fences are created against.
///
/// A fence created at point `p` signals once the timeline value reaches `p`.
#[derive(Clone)]
pub struct SyncTimeline {
    shared: Arc<TimelineShared>,
}

impl SyncTimeline {
    /// Creates a new timeline starting at zero.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(TimelineShared {
                name: name.into(),
                value: Mutex::new(0),
                signaled: Condvar::new(),
            }),
        }
    }

    /// Returns the timeline name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the current timeline value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        *self.shared.value.lock()
    }

    /// Creates a raw sync handle that signals at `point`.
    #[must_use]
    pub fn create_handle(&self, point: u64) -> SyncHandle {
        SyncHandle {
            point: SyncPoint {
                timeline: Arc::clone(&self.shared),
                value: point,
            },
        }
    }

    /// Creates a fence that signals at `point`.
    #[must_use]
    pub fn create_fence(&self, point: u64) -> Fence {
        Fence::from_handle(self.create_handle(point))
    }

    /// Advances the timeline by `step`, signaling every point it passes.
    ///
    /// Returns the new value.
    pub fn advance(&self, step: u64) -> u64 {
        let mut value = self.shared.value.lock();
        *value = value.saturating_add(step);
        self.shared.signaled.notify_all();
        *value
    }

    /// Moves the timeline forward to `point`. Never moves it backwards.
    pub fn signal_to(&self, point: u64) {
        let mut value = self.shared.value.lock();
        if point > *value {
            *value = point;
            self.shared.signaled.notify_all();
        }
    }
}

impl fmt::Debug for SyncTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimeline")
            .field("name", &self.shared.name)
            .field("value", &self.value())
            .finish()
    }
}

/// One point on one timeline.
#[derive(Clone)]
struct SyncPoint {
    timeline: Arc<TimelineShared>,
    value: u64,
}

impl SyncPoint {
    #[inline]
    fn is_signaled(&self) -> bool {
        *self.timeline.value.lock() >= self.value
    }

    #[inline]
    fn same_timeline(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.timeline, &other.timeline)
    }

    /// Blocks until the point signals or `deadline` passes.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut value = self.timeline.value.lock();
        while *value < self.value {
            if self
                .timeline
                .signaled
                .wait_until(&mut value, deadline)
                .timed_out()
            {
                return *value >= self.value;
            }
        }
        true
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timeline.name, self.value)
    }
}

/// An owned raw synchronization handle.
///
/// Not `Clone`: turning it into a [`Fence`] moves ownership into the fence.
#[derive(Debug)]
pub struct SyncHandle {
    point: SyncPoint,
}

/// A synchronization token handed along with a buffer.
///
/// [`Fence::NO_FENCE`] is a valid value meaning "already satisfied".
/// Cloning a fence is cheap and shares the underlying sync points.
#[derive(Clone, Default)]
pub struct Fence {
    points: Option<Arc<[SyncPoint]>>,
}

impl Fence {
    /// The fence that requires no wait.
    pub const NO_FENCE: Fence = Fence { points: None };

    /// Wraps a raw handle, taking ownership of it.
    #[must_use]
    pub fn from_handle(handle: SyncHandle) -> Self {
        Self {
            points: Some(Arc::from(vec![handle.point])),
        }
    }

    /// Returns true if this fence refers to at least one sync point.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.points.is_some()
    }

    /// Returns true if waiting on this fence would not block.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.points
            .as_deref()
            .map_or(true, |points| points.iter().all(SyncPoint::is_signaled))
    }

    /// Blocks the calling thread until the fence signals.
    ///
    /// The hand-off surface never calls this; it is for the producer (before
    /// writing into a released buffer) and for the display (before scan-out).
    ///
    /// # Errors
    ///
    /// Returns [`FenceError::Timeout`] if the fence is still pending after
    /// `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let Some(points) = self.points.as_deref() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        for point in points {
            if !point.wait_until(deadline) {
                return Err(FenceError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Combines two fences into one that signals when both have signaled.
    ///
    /// Points already signaled are dropped and only the latest point per
    /// timeline is kept. If nothing is left pending the result is
    /// [`Fence::NO_FENCE`].
    #[must_use]
    pub fn merge(a: &Fence, b: &Fence) -> Fence {
        let mut merged: Vec<SyncPoint> = Vec::new();
        let candidates = a
            .points
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .chain(b.points.as_deref().unwrap_or(&[]));

        for point in candidates {
            if point.is_signaled() {
                continue;
            }
            match merged.iter_mut().find(|p| p.same_timeline(point)) {
                Some(existing) => existing.value = existing.value.max(point.value),
                None => merged.push(point.clone()),
            }
        }

        if merged.is_empty() {
            Fence::NO_FENCE
        } else {
            Fence {
                points: Some(Arc::from(merged)),
            }
        }
    }
}

impl From<SyncHandle> for Fence {
    fn from(handle: SyncHandle) -> Self {
        Self::from_handle(handle)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.points.as_deref() {
            None => f.write_str("Fence(none)"),
            Some(points) => f.debug_tuple("Fence").field(&points).finish(),
        }
    }
}

impl fmt::Display for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            f.write_str("none")
        } else if self.is_signaled() {
            f.write_str("signaled")
        } else {
            f.write_str("pending")
        }
    }
}
