//! # FRAMELATCH Display
//!
//! The consumer end of a buffer queue: a [`HandoffSurface`] latches one
//! frame at a time and hands it to a [`DisplayPoster`].
//!
//! ## Guarantees
//!
//! 1. **One current slot** - at most one slot is latched at any time
//! 2. **No regression** - with nothing new queued, the previous frame is shown again
//! 3. **Stale tolerant** - a slot freed behind the surface's back is not an error
//! 4. **No fence waits** - fences are passed on, never waited on, by the surface
//!
//! ## Example
//!
//! ```rust,ignore
//! let queue = Arc::new(BufferQueue::new(Arc::new(HeapAllocator::new())));
//! let poster = Arc::new(SoftwarePoster::new(mode));
//! let surface = Arc::new(HandoffSurface::new(&SurfaceConfig::default(), queue.clone(), poster.clone())?);
//! queue.set_consumer_listener(&surface);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod poster;
pub mod surface;

pub use config::{SurfaceConfig, DEFAULT_BUFFER_COUNT};
pub use error::{ConfigError, HandoffError, HandoffResult, PoolOp, PosterError, PosterResult};
pub use poster::{DisplayId, DisplayMode, DisplayPoster, Flip, PosterStats, SoftwarePoster};
pub use surface::{HandoffSurface, Latch, Rect};
