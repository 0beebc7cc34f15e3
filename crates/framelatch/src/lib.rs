//! # FRAMELATCH
//!
//! Runs a buffer queue, a hand-off surface and a display poster as one
//! pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐ dequeue/queue ┌─────────────┐ events ┌─────────────┐ post ┌───────────────┐
//! │ FrameProducer │──────────────>│ BufferQueue │───────>│ Compositor  │─────>│SoftwarePoster │
//! │ (renderer)    │<──────────────│ (pool)      │<───────│  └ Handoff  │<─────│ (display)     │
//! └───────────────┘ release fence └─────────────┘ latch  │    Surface  │ flip └───────────────┘
//!                                                        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - `events`: pool notifications as messages
//! - `compositor`: the single thread that drives the surface
//! - `producer`: a stand-in renderer
//! - `config`: the demo's TOML file

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod compositor;
pub mod config;
pub mod events;
pub mod producer;

// Re-export the layers
pub use framelatch_core as core;
pub use framelatch_display as display;

pub use compositor::{Compositor, CompositorConfig, CompositorStats};
pub use config::FramelatchConfig;
pub use events::{EventBus, EventReceiver, EventSender, HandoffEvent};
pub use producer::{FrameProducer, ProducedFrame, ProducerConfig, ProducerError, ProducerRun};
