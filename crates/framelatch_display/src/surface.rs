//! # Hand-off Surface
//!
//! Consumer end of a buffer queue that feeds a display. It keeps exactly
//! one slot latched as "current" and hands that slot's buffer to the
//! display poster together with the producer's acquire fence.
//!
//! ## Latching
//!
//! ```text
//!             acquire slot N (N != current)           acquire slot N (N == current)
//!   NoSlot ───────────────────────────────> Current(N) ───────────────────────────────> Current(N)
//!     ▲          release previous                          no release, buffer re-read
//!     │                                          │
//!     └──────── on_slot_freed(current) ──────────┘
//! ```
//!
//! ## Thread Safety
//!
//! All latch state sits behind one mutex, held across acquire, the
//! release-or-skip decision and the current-slot update. Posting happens
//! after the lock is dropped. The surface never waits on a fence; fences
//! are passed on to whoever touches the pixels.
//!
//! Lock order is surface, then slot table. The slot table must not call
//! back into the surface from `acquire_next`/`release`.

use std::fmt::Write as _;
use std::sync::Arc;

use framelatch_core::{BufferHandle, ConsumerListener, Fence, PoolError, SlotIndex, SlotTable};
use parking_lot::Mutex;

use crate::config::SurfaceConfig;
use crate::error::{HandoffError, HandoffResult, PoolOp};
use crate::poster::{DisplayId, DisplayPoster};

/// A region of a buffer, in pixels. `right` and `bottom` are exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge, exclusive.
    pub right: i32,
    /// Bottom edge, exclusive.
    pub bottom: i32,
}

impl Rect {
    /// Creates a rectangle from its edges.
    #[must_use]
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Outcome of [`HandoffSurface::next_buffer`].
#[derive(Debug, Clone)]
pub enum Latch {
    /// A new frame was latched.
    Fresh {
        /// The slot now current.
        slot: SlotIndex,
        /// The slot's buffer, read from the table after latching. `None` if
        /// the pool freed it in the meantime.
        buffer: Option<BufferHandle>,
        /// Acquire fence of the frame.
        fence: Fence,
    },
    /// Nothing new was queued; the display keeps the previous frame.
    Unchanged {
        /// Buffer of the previous latch, or `None` if there is none.
        buffer: Option<BufferHandle>,
    },
}

impl Latch {
    /// Returns true if a new frame was latched.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    /// The buffer to display, if any.
    #[must_use]
    pub fn buffer(&self) -> Option<&BufferHandle> {
        match self {
            Self::Fresh { buffer, .. } | Self::Unchanged { buffer } => buffer.as_ref(),
        }
    }

    /// Splits into buffer and fence. Unchanged latches carry no fence.
    #[must_use]
    pub fn into_parts(self) -> (Option<BufferHandle>, Fence) {
        match self {
            Self::Fresh { buffer, fence, .. } => (buffer, fence),
            Self::Unchanged { buffer } => (buffer, Fence::NO_FENCE),
        }
    }
}

struct LatchState {
    current_slot: Option<SlotIndex>,
    current_buffer: Option<BufferHandle>,
    current_fence: Fence,
    frames_latched: u64,
    abandoned: bool,
}

impl LatchState {
    fn clear_current(&mut self) {
        self.current_slot = None;
        self.current_buffer = None;
        self.current_fence = Fence::NO_FENCE;
    }
}

/// Consumer that latches frames from a slot table and posts them to a display.
pub struct HandoffSurface {
    name: String,
    display: DisplayId,
    table: Arc<dyn SlotTable>,
    poster: Arc<dyn DisplayPoster>,
    state: Mutex<LatchState>,
}

impl HandoffSurface {
    /// Creates a surface and configures `table` for the display.
    ///
    /// Format and size come from the display's native mode unless the
    /// config overrides them.
    ///
    /// # Errors
    ///
    /// Invalid config, unknown display, or a slot table that rejects the
    /// settings.
    pub fn new(
        config: &SurfaceConfig,
        table: Arc<dyn SlotTable>,
        poster: Arc<dyn DisplayPoster>,
    ) -> HandoffResult<Self> {
        config.validate()?;
        let mode = poster.native_mode(config.display)?;
        let settings = config.resolve(&mode);
        table
            .configure(&settings)
            .map_err(|source| HandoffError::pool(PoolOp::Configure, None, source))?;

        tracing::info!(
            "{}: display {} {}x{} {}, {} buffers, usage {:?}",
            config.name,
            config.display,
            settings.default_width,
            settings.default_height,
            settings.default_format,
            settings.max_buffer_count,
            settings.usage
        );

        Ok(Self {
            name: config.name.clone(),
            display: config.display,
            table,
            poster,
            state: Mutex::new(LatchState {
                current_slot: None,
                current_buffer: None,
                current_fence: Fence::NO_FENCE,
                frames_latched: 0,
                abandoned: false,
            }),
        })
    }

    /// Surface name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display this surface posts to.
    #[inline]
    #[must_use]
    pub fn display(&self) -> DisplayId {
        self.display
    }

    /// Slot currently latched.
    #[must_use]
    pub fn current_slot(&self) -> Option<SlotIndex> {
        self.state.lock().current_slot
    }

    /// Buffer of the current slot, as of the last latch.
    #[must_use]
    pub fn current_buffer(&self) -> Option<BufferHandle> {
        self.state.lock().current_buffer.clone()
    }

    /// Acquire fence of the current frame.
    #[must_use]
    pub fn current_fence(&self) -> Fence {
        self.state.lock().current_fence.clone()
    }

    /// Number of fresh frames latched so far.
    #[must_use]
    pub fn frames_latched(&self) -> u64 {
        self.state.lock().frames_latched
    }

    /// Returns true after [`HandoffSurface::abandon`].
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    /// Latches the next queued frame, if there is one.
    ///
    /// With nothing queued the previous buffer comes back unchanged. The
    /// previous slot is released unless the new frame reuses its index.
    ///
    /// # Errors
    ///
    /// Slot table failures other than `NoBufferAvailable` and `StaleSlot`.
    /// A failed call leaves the current slot untouched.
    pub fn next_buffer(&self) -> HandoffResult<Latch> {
        let mut state = self.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }

        let item = match self.table.acquire_next() {
            Ok(item) => item,
            Err(PoolError::NoBufferAvailable) => {
                return Ok(Latch::Unchanged {
                    buffer: state.current_buffer.clone(),
                });
            }
            Err(source) => {
                tracing::error!("{}: acquire failed: {}", self.name, source);
                return Err(HandoffError::pool(PoolOp::Acquire, None, source));
            }
        };

        // Releasing the same index would recycle the buffer about to be shown.
        if let Some(previous) = state.current_slot.filter(|&slot| slot != item.slot) {
            match self.table.release(previous, Fence::NO_FENCE) {
                Ok(()) => {}
                Err(PoolError::StaleSlot(_)) => {
                    tracing::debug!("{}: slot {} already freed by the pool", self.name, previous);
                }
                Err(source) => {
                    tracing::error!("{}: release of slot {} failed: {}", self.name, previous, source);
                    return Err(HandoffError::pool(PoolOp::Release, Some(previous), source));
                }
            }
        }

        let buffer = self.table.buffer(item.slot);
        state.current_slot = Some(item.slot);
        state.current_buffer = buffer.clone();
        state.current_fence = item.acquire_fence.clone();
        state.frames_latched += 1;

        tracing::trace!(
            "{}: latched frame {} in slot {}",
            self.name,
            item.frame_number,
            item.slot
        );
        Ok(Latch::Fresh {
            slot: item.slot,
            buffer,
            fence: item.acquire_fence,
        })
    }

    /// Latches and posts. Called whenever the producer queued a frame.
    ///
    /// Posts nothing if there is no buffer to show. Returns whether a
    /// newly queued frame was latched.
    ///
    /// # Errors
    ///
    /// Latch or poster failures. They are logged here; the previous frame
    /// stays on screen.
    pub fn on_buffer_ready(&self) -> HandoffResult<bool> {
        let latch = self.next_buffer().map_err(|err| {
            tracing::error!("{}: frame not posted: {}", self.name, err);
            err
        })?;

        let fresh = latch.is_fresh();
        let (buffer, fence) = latch.into_parts();
        let Some(buffer) = buffer else {
            tracing::debug!("{}: no buffer to post", self.name);
            return Ok(fresh);
        };

        self.poster.post(self.display, fence, buffer).map_err(|err| {
            tracing::error!("{}: post to display {} failed: {}", self.name, self.display, err);
            HandoffError::from(err)
        })?;
        Ok(fresh)
    }

    /// Forgets the current slot if the pool freed its buffer.
    ///
    /// Notices can arrive late. If the slot already holds the buffer this
    /// surface latched, the notice is about an older buffer and the
    /// current slot stays.
    pub fn on_slot_freed(&self, slot: SlotIndex) {
        let mut state = self.state.lock();
        if state.current_slot != Some(slot) {
            return;
        }
        let latched = state.current_buffer.as_ref().map(|buffer| buffer.id());
        let in_table = self.table.buffer(slot).map(|buffer| buffer.id());
        if latched.is_some() && latched == in_table {
            tracing::debug!("{}: late free of slot {} ignored, buffer re-latched", self.name, slot);
            return;
        }
        state.clear_current();
        tracing::debug!("{}: current slot {} freed", self.name, slot);
    }

    /// Attaches a release fence to the current slot.
    ///
    /// The pool makes the producer wait on it before reusing the buffer.
    /// Does nothing for an invalid fence or when nothing is latched.
    ///
    /// # Errors
    ///
    /// Slot table failures; the surface state is not affected.
    pub fn set_release_fence(&self, fence: Fence) -> HandoffResult<()> {
        if !fence.is_valid() {
            return Ok(());
        }
        let state = self.state.lock();
        if state.abandoned {
            return Err(HandoffError::Abandoned);
        }
        let Some(slot) = state.current_slot else {
            return Ok(());
        };
        self.table.add_release_fence(slot, fence).map_err(|source| {
            tracing::error!("{}: failed to attach release fence to slot {}: {}", self.name, slot, source);
            HandoffError::pool(PoolOp::AddReleaseFence, Some(slot), source)
        })
    }

    /// Tells the poster composition for this frame is done.
    ///
    /// # Errors
    ///
    /// Poster failures.
    pub fn composition_complete(&self) -> HandoffResult<()> {
        Ok(self.poster.composition_complete()?)
    }

    /// Partial updates are not supported; whole buffers are always handed off.
    ///
    /// # Errors
    ///
    /// Always [`HandoffError::UnsupportedOperation`].
    pub fn set_update_rectangle(&self, _rect: Rect) -> HandoffResult<()> {
        Err(HandoffError::UnsupportedOperation("set_update_rectangle"))
    }

    /// Drops the current frame and disconnects from the slot table.
    ///
    /// Later hand-off calls fail with [`HandoffError::Abandoned`].
    /// Calling this twice is fine.
    ///
    /// # Errors
    ///
    /// The slot table refused the disconnect.
    pub fn abandon(&self) -> HandoffResult<()> {
        let mut state = self.state.lock();
        if state.abandoned {
            return Ok(());
        }
        state.abandoned = true;
        state.clear_current();

        match self.table.disconnect() {
            Ok(()) | Err(PoolError::Abandoned) => {
                tracing::info!("{}: abandoned after {} frames", self.name, state.frames_latched);
                Ok(())
            }
            Err(source) => Err(HandoffError::pool(PoolOp::Disconnect, None, source)),
        }
    }

    /// Appends a text snapshot of the surface, its poster and its slot table.
    pub fn dump(&self, out: &mut String) {
        {
            let state = self.state.lock();
            let slot = state
                .current_slot
                .map_or_else(|| String::from("none"), |slot| slot.to_string());
            let buffer = state
                .current_buffer
                .as_ref()
                .map_or_else(|| String::from("none"), |buffer| buffer.id().to_string());
            let _ = writeln!(
                out,
                "HandoffSurface '{}': display={} current_slot={} current_buffer={} fence={} frames_latched={} abandoned={}",
                self.name,
                self.display,
                slot,
                buffer,
                state.current_fence,
                state.frames_latched,
                state.abandoned,
            );
        }
        self.poster.dump(out);
        self.table.dump(out, "  ");
    }
}

impl ConsumerListener for HandoffSurface {
    fn on_frame_available(&self) {
        // Already logged.
        let _ = self.on_buffer_ready();
    }

    fn on_slot_freed(&self, slot: SlotIndex) {
        HandoffSurface::on_slot_freed(self, slot);
    }
}
