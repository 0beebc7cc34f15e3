//! # Display Posters
//!
//! The device side of the hand-off: something that accepts a buffer plus
//! its acquire fence and schedules it for scan-out.

mod software;

pub use software::{Flip, PosterStats, SoftwarePoster};

use std::fmt;

use framelatch_core::{BufferHandle, Fence, PixelFormat};
use serde::{Deserialize, Serialize};

use crate::error::PosterResult;

/// Identifier of a physical display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(pub u32);

impl DisplayId {
    /// The built-in display.
    pub const PRIMARY: DisplayId = DisplayId(0);
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Native configuration of a display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Scan-out format.
    pub format: PixelFormat,
    /// Refresh rate in Hz.
    pub refresh_hz: u32,
}

/// Accepts buffers for scan-out.
///
/// `post` must not block on the fence. Waiting for the producer is the
/// device's business, at flip time.
pub trait DisplayPoster: Send + Sync {
    /// Native mode of `display`.
    ///
    /// # Errors
    ///
    /// [`PosterError::DisplayNotFound`](crate::PosterError::DisplayNotFound)
    /// for an unknown display.
    fn native_mode(&self, display: DisplayId) -> PosterResult<DisplayMode>;

    /// Schedules `buffer` for scan-out once `fence` signals.
    ///
    /// # Errors
    ///
    /// Whatever the device reports.
    fn post(&self, display: DisplayId, fence: Fence, buffer: BufferHandle) -> PosterResult<()>;

    /// Signals that composition for the current frame has finished.
    ///
    /// # Errors
    ///
    /// Whatever the device reports.
    fn composition_complete(&self) -> PosterResult<()>;

    /// Appends a text snapshot of the poster to `out`.
    fn dump(&self, _out: &mut String) {}
}
