// SPDX-License-Identifier: MPL-2.0

//! Error kinds of the playback engine.
//!
//! Every error is terminal for the clip it occurs in: the clip transitions to
//! [`State::Error`](crate::State::Error), its backend is dropped and one
//! `Reinit` notification is emitted. The engine itself never fails.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    /// The backing file cannot be accessed.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The decoder rejected the source at open time.
    #[error("decoder failed to open: {0}")]
    DecoderOpenFailed(String),

    /// Demux or decode of a frame failed mid-stream.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// A decoded frame could not be rendered to pixels.
    #[error("render failed: {0}")]
    RenderFailed(String),

    /// Probe only: the first frame has an aspect ratio beyond 10:1.
    #[error("unplayable dimensions: {width}x{height}")]
    UnplayableDimensions { width: u32, height: u32 },
}
