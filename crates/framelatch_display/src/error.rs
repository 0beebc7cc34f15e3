//! # Display Error Types
//!
//! Errors from the display poster, the surface configuration and the
//! hand-off surface itself.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use framelatch_core::{PoolError, SlotIndex};
use thiserror::Error;

use crate::poster::DisplayId;

/// Errors reported by a display poster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PosterError {
    /// The poster does not drive this display.
    #[error("display {0} not found")]
    DisplayNotFound(DisplayId),

    /// A flip was requested with no frame posted.
    #[error("nothing posted to display")]
    NothingToPost,

    /// The acquire fence of the pending frame did not signal in time.
    #[error("acquire fence not signaled after {0:?}")]
    FenceTimeout(Duration),

    /// The device refused the buffer.
    #[error("post rejected: {0}")]
    Rejected(String),
}

/// Result type for poster operations.
pub type PosterResult<T> = Result<T, PosterError>;

/// Errors loading or validating a surface configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed, but the values are out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Slot table call that failed inside the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolOp {
    /// `configure`
    Configure,
    /// `acquire_next`
    Acquire,
    /// `release`
    Release,
    /// `add_release_fence`
    AddReleaseFence,
    /// `disconnect`
    Disconnect,
}

impl fmt::Display for PoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configure => "configure",
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::AddReleaseFence => "add release fence",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the hand-off surface.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// A slot table call failed.
    #[error("{op} failed{}: {source}", .slot.map(|s| format!(" for slot {s}")).unwrap_or_default())]
    Pool {
        /// Which call failed.
        op: PoolOp,
        /// Slot involved, if any.
        slot: Option<SlotIndex>,
        /// Error from the slot table.
        #[source]
        source: PoolError,
    },

    /// The display poster failed.
    #[error("display poster error: {0}")]
    Poster(#[from] PosterError),

    /// The surface does not implement this operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The surface was abandoned.
    #[error("surface has been abandoned")]
    Abandoned,

    /// The surface configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HandoffError {
    pub(crate) fn pool(op: PoolOp, slot: Option<SlotIndex>, source: PoolError) -> Self {
        Self::Pool { op, slot, source }
    }
}

/// Result type for hand-off operations.
pub type HandoffResult<T> = Result<T, HandoffError>;
