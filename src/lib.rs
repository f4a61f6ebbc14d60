// SPDX-License-Identifier: MPL-2.0

//! Concurrent looping-clip playback engine.
//!
//! A small fixed pool of worker threads decodes looping animations and
//! publishes frames to a consumer thread that paints them at the right
//! wall-clock time. Each clip hands frames over through a lock-light triple
//! buffer: one atomic step word designates which of three slots the consumer
//! may read and which the worker may write, so the paint path never blocks.
//!
//! # Module Structure
//!
//! - [`engine`]: worker pool, least-loaded clip assignment, shutdown
//! - [`clip`]: the public [`Clip`] handle and its shared state
//! - [`slot`]: the step word and the triple-buffer hand-off
//! - [`backend`]: worker-private per-clip decode protocol
//! - [`worker`]: per-thread cooperative scheduler over many clips
//! - [`decode`]: the [`Decoder`] capability and the built-in GIF decoder
//! - [`prepare`]: resize, letterbox, alpha flatten, corner rounding
//! - [`probe`]: one-shot metadata probing for attachment handling
//!
//! # Playback Flow
//!
//! ```text
//! Clip::new ──▶ Engine ──▶ Worker ──▶ ClipBackend ──▶ decode / prepare
//!     ▲                     │
//!     │  Reinit / Repaint   │
//!     └─────── callback ◀───┘
//! ```
//!
//! The consumer reacts to `Reinit` by re-laying out and calling
//! [`Clip::start`], then paints every `Repaint` with [`Clip::current`]. A
//! clip whose consumer stops painting is paused automatically and resumes on
//! the next `current` call; a clip that fails decodes is parked in a
//! terminal error state without disturbing its peers.

mod backend;
mod clip;
mod config;
mod decode;
mod engine;
mod error;
mod prepare;
mod probe;
mod slot;
mod types;
mod worker;

pub use clip::Clip;
pub use config::EngineConfig;
pub use decode::{DecodedFrame, Decoder, DecoderMode, GifClipDecoder};
pub use engine::Engine;
pub use error::ClipError;
pub use probe::{probe, ClipMeta};
pub use types::{ClipSource, FrameRequest, Mode, Notification, State};
