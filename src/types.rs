// SPDX-License-Identifier: MPL-2.0

//! Core types shared across the playback engine.

use std::{
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

/// Minimum inter-frame delay. Decoders reporting anything shorter are clamped
/// so a malformed file cannot spin a worker.
pub(crate) const MIN_FRAME_DELAY_MS: u64 = 5;

/// Frame delay used when a GIF declares a zero delay.
pub(crate) const DEFAULT_FRAME_DELAY_MS: u64 = 100;

/// Reschedule sentinel for clips with nothing to do: one day from now.
pub(crate) const NEVER_DELAY_MS: u64 = 86_400_000;

/// Corner radius of the rounded mask, in logical pixels (scaled by the
/// request's device-pixel factor).
pub(crate) const ROUNDED_RADIUS: u32 = 4;

/// Playback mode of a clip.
///
/// The engine plays both silently and forward-only; the distinction is kept
/// for decoder open modes and upstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Silent looping animation.
    Gif,
    /// Video clip; audio, if any, is handled upstream.
    Video,
}

/// Lifecycle state of a clip. `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Reading,
    Error,
}

/// Notification delivered through a clip's callback, on the worker thread.
///
/// `Reinit` means size or readiness changed and the consumer should re-layout
/// before painting; `Repaint` means a new frame is available at the current
/// size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Reinit,
    Repaint,
}

/// The geometry a consumer wants painted, in device pixels.
///
/// `frame` is the decoded inner size, `outer` the target canvas (letterboxed
/// when larger). A request is valid once all four dimensions are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub frame_w: u32,
    pub frame_h: u32,
    pub outer_w: u32,
    pub outer_h: u32,
    /// Integer device-pixel ratio of the target display.
    pub factor: u32,
    /// Apply a rounded-corner mask to the prepared pixmap.
    pub rounded: bool,
}

impl FrameRequest {
    /// Build a request from logical dimensions, scaling by `factor`.
    #[must_use]
    pub fn scaled(
        frame_w: u32,
        frame_h: u32,
        outer_w: u32,
        outer_h: u32,
        factor: u32,
        rounded: bool,
    ) -> Self {
        Self {
            frame_w: frame_w * factor,
            frame_h: frame_h * factor,
            outer_w: outer_w * factor,
            outer_h: outer_h * factor,
            factor,
            rounded,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.frame_w > 0 && self.frame_h > 0 && self.outer_w > 0 && self.outer_h > 0
    }
}

impl Default for FrameRequest {
    fn default() -> Self {
        Self {
            frame_w: 0,
            frame_h: 0,
            outer_w: 0,
            outer_h: 0,
            factor: 1,
            rounded: false,
        }
    }
}

/// Backing bytes of a clip: an in-memory buffer or a filesystem path.
///
/// Path sources at or below the engine's in-memory limit are slurped into
/// memory when the decoder is first constructed; larger files stream from
/// disk for every loop.
#[derive(Debug, Clone)]
pub enum ClipSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

impl ClipSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Memory(bytes.into())
    }
}

/// Identifier of a clip, unique for the lifetime of its engine.
///
/// Ids are assigned monotonically and never reused, so a stale id can never
/// be confused with a newer clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClipId(pub(crate) u64);

/// Monotonic engine clock, in milliseconds.
#[derive(Debug)]
pub(crate) struct Clock {
    started: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds since the engine started. Never zero: zero is the
    /// empty-slot sentinel for frame timestamps.
    pub(crate) fn now_ms(&self) -> u64 {
        (self.started.elapsed().as_millis() as u64).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validity() {
        assert!(!FrameRequest::default().valid());
        assert!(FrameRequest::scaled(10, 10, 20, 20, 1, false).valid());
        assert!(!FrameRequest::scaled(0, 10, 20, 20, 1, false).valid());
        assert!(!FrameRequest::scaled(10, 10, 20, 0, 1, false).valid());
    }

    #[test]
    fn test_request_scales_by_factor() {
        let request = FrameRequest::scaled(100, 50, 120, 60, 2, true);
        assert_eq!(request.frame_w, 200);
        assert_eq!(request.frame_h, 100);
        assert_eq!(request.outer_w, 240);
        assert_eq!(request.outer_h, 120);
        assert_eq!(request.factor, 2);
        assert!(request.rounded);
    }

    #[test]
    fn test_clock_never_returns_zero() {
        let clock = Clock::new();
        assert!(clock.now_ms() >= 1);
    }
}
