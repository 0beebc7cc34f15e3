//! Software scan-out.
//!
//! Keeps the most recently posted frame pending until the caller drives a
//! vsync. At vsync the pending acquire fence is waited on, the frame goes
//! on screen, and the frame it replaced gets its release fence signaled.
//!
//! ```text
//!   post(A)      vsync           post(B)      vsync
//!   pending=A ─> on_screen=A ──> pending=B ─> on_screen=B, A's release fence signals
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use framelatch_core::{BufferHandle, Fence, SyncTimeline};
use parking_lot::Mutex;

use super::{DisplayId, DisplayMode, DisplayPoster};
use crate::error::{PosterError, PosterResult};

/// A frame that went on screen at vsync.
#[derive(Debug, Clone)]
pub struct Flip {
    /// The buffer now being scanned out.
    pub buffer: BufferHandle,
    /// Signals once `buffer` has been replaced by a later flip.
    pub release_fence: Fence,
}

/// Snapshot of the poster counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PosterStats {
    /// Frames handed to `post`.
    pub posts: u64,
    /// Frames that reached the screen.
    pub flips: u64,
    /// `composition_complete` calls.
    pub compositions: u64,
}

struct PendingFrame {
    buffer: BufferHandle,
    fence: Fence,
    /// Sequence number of the post, to detect a newer post during a wait.
    sequence: u64,
}

struct OnScreen {
    buffer: BufferHandle,
    release_point: u64,
}

#[derive(Default)]
struct ScanoutState {
    pending: Option<PendingFrame>,
    on_screen: Option<OnScreen>,
    last_release_point: u64,
    post_sequence: u64,
}

/// A single-display poster that flips when told to.
pub struct SoftwarePoster {
    display: DisplayId,
    mode: DisplayMode,
    state: Mutex<ScanoutState>,
    release_timeline: SyncTimeline,
    posts: AtomicU64,
    flips: AtomicU64,
    compositions: AtomicU64,
}

impl SoftwarePoster {
    /// Creates a poster driving the primary display.
    #[must_use]
    pub fn new(mode: DisplayMode) -> Self {
        Self::with_display(DisplayId::PRIMARY, mode)
    }

    /// Creates a poster driving `display`.
    #[must_use]
    pub fn with_display(display: DisplayId, mode: DisplayMode) -> Self {
        Self {
            display,
            mode,
            state: Mutex::new(ScanoutState::default()),
            release_timeline: SyncTimeline::new(format!("display-{display}")),
            posts: AtomicU64::new(0),
            flips: AtomicU64::new(0),
            compositions: AtomicU64::new(0),
        }
    }

    /// The display this poster drives.
    #[inline]
    #[must_use]
    pub fn display(&self) -> DisplayId {
        self.display
    }

    /// Buffer currently being scanned out.
    #[must_use]
    pub fn on_screen(&self) -> Option<BufferHandle> {
        self.state.lock().on_screen.as_ref().map(|s| BufferHandle::clone(&s.buffer))
    }

    /// Returns true if a posted frame is waiting for vsync.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> PosterStats {
        PosterStats {
            posts: self.posts.load(Ordering::Relaxed),
            flips: self.flips.load(Ordering::Relaxed),
            compositions: self.compositions.load(Ordering::Relaxed),
        }
    }

    /// Flips the pending frame onto the screen.
    ///
    /// Returns `Ok(None)` when nothing is pending. The previous on-screen
    /// frame's release fence signals here.
    ///
    /// # Errors
    ///
    /// [`PosterError::FenceTimeout`] if the pending frame's acquire fence
    /// does not signal within `timeout`. The frame stays pending unless a
    /// newer one was posted in the meantime.
    pub fn vsync(&self, timeout: Duration) -> PosterResult<Option<Flip>> {
        let Some(frame) = self.state.lock().pending.take() else {
            return Ok(None);
        };

        // Wait without the lock so posts aren't held up by a slow producer.
        if frame.fence.wait(timeout).is_err() {
            let mut state = self.state.lock();
            if state.pending.is_none() {
                state.pending = Some(frame);
            }
            tracing::warn!("display {}: acquire fence still pending after {:?}", self.display, timeout);
            return Err(PosterError::FenceTimeout(timeout));
        }

        let mut state = self.state.lock();
        if let Some(previous) = state.on_screen.take() {
            self.release_timeline.signal_to(previous.release_point);
        }
        state.last_release_point += 1;
        let release_point = state.last_release_point;
        state.on_screen = Some(OnScreen {
            buffer: BufferHandle::clone(&frame.buffer),
            release_point,
        });
        drop(state);

        self.flips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("display {}: flipped post #{} buffer {}", self.display, frame.sequence, frame.buffer.id());
        Ok(Some(Flip {
            buffer: frame.buffer,
            release_fence: self.release_timeline.create_fence(release_point),
        }))
    }

    fn check_display(&self, display: DisplayId) -> PosterResult<()> {
        if display == self.display {
            Ok(())
        } else {
            Err(PosterError::DisplayNotFound(display))
        }
    }
}

impl DisplayPoster for SoftwarePoster {
    fn native_mode(&self, display: DisplayId) -> PosterResult<DisplayMode> {
        self.check_display(display)?;
        Ok(self.mode)
    }

    fn post(&self, display: DisplayId, fence: Fence, buffer: BufferHandle) -> PosterResult<()> {
        self.check_display(display)?;
        let mut state = self.state.lock();
        state.post_sequence += 1;
        let sequence = state.post_sequence;
        if let Some(dropped) = state.pending.replace(PendingFrame {
            buffer,
            fence,
            sequence,
        }) {
            tracing::trace!("display {}: post #{} replaced before vsync", self.display, dropped.sequence);
        }
        drop(state);

        self.posts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn composition_complete(&self) -> PosterResult<()> {
        self.compositions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dump(&self, out: &mut String) {
        let stats = self.stats();
        let state = self.state.lock();
        let _ = writeln!(
            out,
            "SoftwarePoster display={} mode={}x{} {} @{}Hz posts={} flips={} compositions={}",
            self.display,
            self.mode.width,
            self.mode.height,
            self.mode.format,
            self.mode.refresh_hz,
            stats.posts,
            stats.flips,
            stats.compositions,
        );
        let on_screen = state
            .on_screen
            .as_ref()
            .map_or_else(|| String::from("none"), |s| s.buffer.id().to_string());
        let pending = state
            .pending
            .as_ref()
            .map_or_else(|| String::from("none"), |p| format!("{} fence={}", p.buffer.id(), p.fence));
        let _ = writeln!(out, "  on_screen={on_screen} pending={pending}");
    }
}
