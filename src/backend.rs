// SPDX-License-Identifier: MPL-2.0

//! Worker-private per-clip state: the decoder instance and the per-frame
//! protocol that drives it.
//!
//! A backend renders into its own frame mirrors; the worker copies a mirror
//! into the clip's matching slot when a frame is accepted, so the backend
//! itself never touches consumer-visible memory.

use std::{fs, sync::Arc};

use image::RgbaImage;
use tracing::{debug, warn};

use crate::{
    decode::{self, Decoder, DecoderMode},
    error::ClipError,
    prepare,
    types::{ClipSource, Clock, FrameRequest, Mode, State, MIN_FRAME_DELAY_MS},
};

/// Outcome of one scheduling step for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessResult {
    Error,
    Started,
    Wait,
    Repaint,
    CopyFrame,
    Paused,
}

/// Producer-side mirror of one clip slot.
#[derive(Default)]
pub(crate) struct BackendFrame {
    pub original: Option<Arc<RgbaImage>>,
    pub prepared: Option<Arc<RgbaImage>>,
    pub has_alpha: bool,
    /// Monotonic time this frame should first be shown; zero until rendered.
    pub when: u64,
    cache: Option<RgbaImage>,
}

pub(crate) struct ClipBackend {
    mode: Mode,
    state: State,
    /// `None` once decoding stopped for good.
    source: Option<ClipSource>,
    decoder: Option<Box<dyn Decoder>>,
    /// Last geometry sampled from the clip's write slot.
    pub request: FrameRequest,
    frames: [BackendFrame; 3],
    /// Index of the clip slot the next accepted frame targets.
    pub write_index: usize,
    pub width: u32,
    pub height: u32,
    pub next_frame_when: u64,
    pub paused: bool,
    /// Whether the real pixel footprint has replaced the average estimate in
    /// the worker's load level.
    pub counted: bool,
    clock: Arc<Clock>,
    in_memory_limit: u64,
}

impl ClipBackend {
    pub(crate) fn new(
        source: Option<ClipSource>,
        mode: Mode,
        clock: Arc<Clock>,
        in_memory_limit: u64,
    ) -> Self {
        let mut backend = Self {
            mode,
            state: State::Reading,
            source,
            decoder: None,
            request: FrameRequest::default(),
            frames: Default::default(),
            write_index: 0,
            width: 0,
            height: 0,
            next_frame_when: 0,
            paused: false,
            counted: false,
            clock,
            in_memory_limit,
        };
        match &backend.source {
            None => {
                backend.state = State::Error;
            }
            Some(ClipSource::Path(path)) => {
                if let Err(err) = fs::metadata(path) {
                    warn!(path = %path.display(), ?err, "clip source unavailable");
                    backend.state = State::Error;
                    backend.source = None;
                }
            }
            Some(ClipSource::Memory(_)) => {}
        }
        backend
    }

    /// One scheduling step: decide what the worker should do for this clip.
    pub(crate) fn process(&mut self, now: u64) -> ProcessResult {
        if self.state == State::Error {
            return ProcessResult::Error;
        }
        if !self.request.valid() {
            return self.start();
        }
        if !self.paused && now >= self.next_frame_when {
            return ProcessResult::Repaint;
        }
        ProcessResult::Wait
    }

    /// Decode and render the frame a previously accepted `Repaint` targets.
    pub(crate) fn finish_process(&mut self, now: u64) -> ProcessResult {
        if let Err(err) = self.read_next(false) {
            return self.fail(err);
        }
        // Behind wall clock: drop one frame to catch up.
        if now >= self.next_frame_when {
            if let Err(err) = self.read_next(true) {
                return self.fail(err);
            }
        }
        if let Err(err) = self.render() {
            return self.fail(err);
        }
        ProcessResult::CopyFrame
    }

    /// Lazily construct the decoder and pull frame zero at native size.
    fn start(&mut self) -> ProcessResult {
        if self.decoder.is_none() {
            if let Err(err) = self.init() {
                return self.fail(err);
            }
        }
        if self.frames[0].original.is_some() {
            return ProcessResult::Wait;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return self.fail(ClipError::DecoderOpenFailed("decoder missing".into()));
        };
        let first = decoder
            .read_next_frame()
            .and_then(|()| decoder.render_frame(None));
        match first {
            Ok(frame) => {
                self.width = frame.image.width();
                self.height = frame.image.height();
                self.write_index = 0;
                self.frames[0] = BackendFrame {
                    original: Some(Arc::new(frame.image)),
                    prepared: None,
                    has_alpha: frame.has_alpha,
                    when: 0,
                    cache: None,
                };
                debug!(width = self.width, height = self.height, "clip started");
                ProcessResult::Started
            }
            Err(err) => self.fail(err),
        }
    }

    fn init(&mut self) -> Result<(), ClipError> {
        // Small files are slurped into memory; a failed read falls back to
        // streaming from disk.
        if let Some(ClipSource::Path(path)) = &self.source {
            let meta = fs::metadata(path)
                .map_err(|err| ClipError::SourceUnavailable(format!("{}: {err}", path.display())))?;
            if meta.len() <= self.in_memory_limit {
                match fs::read(path) {
                    Ok(bytes) => self.source = Some(ClipSource::from_bytes(bytes)),
                    Err(err) => {
                        debug!(path = %path.display(), ?err, "slurp failed, streaming from disk");
                    }
                }
            }
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ClipError::SourceUnavailable("source already closed".into()))?;
        let mode = match self.mode {
            Mode::Gif => DecoderMode::Silent,
            Mode::Video => DecoderMode::Normal,
        };
        self.decoder = Some(decode::open_decoder(source, mode)?);
        Ok(())
    }

    fn read_next(&mut self, keep_up: bool) -> Result<(), ClipError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| ClipError::DecodeFailed("decoder missing".into()))?;
        decoder.read_next_frame()?;
        self.next_frame_when += decoder.next_frame_delay().max(MIN_FRAME_DELAY_MS);
        if keep_up {
            self.next_frame_when = self.next_frame_when.max(self.clock.now_ms());
        }
        Ok(())
    }

    fn render(&mut self) -> Result<(), ClipError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| ClipError::RenderFailed("decoder missing".into()))?;
        let target = (self.request.frame_w, self.request.frame_h);
        let decoded = decoder.render_frame(Some(target))?;
        let has_alpha = decoded.has_alpha;
        let original = Arc::new(decoded.image);
        let frame = &mut self.frames[self.write_index];
        frame.prepared = Some(
            if prepare::needs_preparation(&self.request, original.dimensions(), has_alpha) {
                Arc::new(prepare::prepare_frame(
                    &self.request,
                    &original,
                    has_alpha,
                    &mut frame.cache,
                ))
            } else {
                original.clone()
            },
        );
        frame.original = Some(original);
        frame.has_alpha = has_alpha;
        frame.when = self.next_frame_when;
        Ok(())
    }

    fn fail(&mut self, err: ClipError) -> ProcessResult {
        warn!(%err, "clip failed");
        self.stop();
        self.state = State::Error;
        ProcessResult::Error
    }

    /// Release the decoder and the source handle.
    pub(crate) fn stop(&mut self) {
        self.decoder = None;
        self.source = None;
    }

    /// The frame mirror the next accepted result publishes.
    pub(crate) fn frame(&self) -> &BackendFrame {
        &self.frames[self.write_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::encode_gif;

    fn backend_for(bytes: Vec<u8>) -> ClipBackend {
        ClipBackend::new(
            Some(ClipSource::from_bytes(bytes)),
            Mode::Gif,
            Arc::new(Clock::new()),
            10 * 1024 * 1024,
        )
    }

    #[test]
    fn test_first_process_starts_and_records_dimensions() {
        let mut backend = backend_for(encode_gif(12, 8, 3, 4));
        assert_eq!(backend.process(1), ProcessResult::Started);
        assert_eq!((backend.width, backend.height), (12, 8));
        assert!(backend.frames[0].original.is_some());
        assert_eq!(backend.frames[0].when, 0);
        // No request yet: nothing further to do.
        assert_eq!(backend.process(2), ProcessResult::Wait);
    }

    #[test]
    fn test_repaint_when_deadline_reached() {
        let mut backend = backend_for(encode_gif(12, 8, 3, 4));
        assert_eq!(backend.process(1), ProcessResult::Started);
        backend.next_frame_when = 1;
        backend.request = FrameRequest::scaled(12, 8, 12, 8, 1, false);
        assert_eq!(backend.process(1), ProcessResult::Repaint);
        assert_eq!(backend.process(0), ProcessResult::Wait);
    }

    #[test]
    fn test_finish_process_commits_a_prepared_frame() {
        let mut backend = backend_for(encode_gif(12, 8, 3, 4));
        assert_eq!(backend.process(1), ProcessResult::Started);
        backend.next_frame_when = 1;
        backend.request = FrameRequest::scaled(12, 8, 12, 8, 1, false);
        backend.write_index = 0;
        assert_eq!(backend.finish_process(1), ProcessResult::CopyFrame);
        let frame = backend.frame();
        assert!(frame.prepared.is_some());
        // 40 ms frame delay from the file.
        assert_eq!(frame.when, 41);
    }

    #[test]
    fn test_delays_are_clamped_to_the_minimum() {
        let mut backend = backend_for(encode_gif(12, 8, 4, 0));
        assert_eq!(backend.process(1), ProcessResult::Started);
        backend.next_frame_when = 1;
        backend.request = FrameRequest::scaled(12, 8, 12, 8, 1, false);
        assert_eq!(backend.finish_process(1), ProcessResult::CopyFrame);
        let first = backend.frame().when;
        backend.next_frame_when = first;
        assert_eq!(backend.finish_process(1), ProcessResult::CopyFrame);
        assert!(backend.frame().when - first >= MIN_FRAME_DELAY_MS);
    }

    #[test]
    fn test_paused_backend_waits() {
        let mut backend = backend_for(encode_gif(12, 8, 3, 4));
        assert_eq!(backend.process(1), ProcessResult::Started);
        backend.request = FrameRequest::scaled(12, 8, 12, 8, 1, false);
        backend.next_frame_when = 1;
        backend.paused = true;
        assert_eq!(backend.process(100), ProcessResult::Wait);
    }

    #[test]
    fn test_bad_source_is_terminal() {
        let mut backend = backend_for(b"not a gif".to_vec());
        assert_eq!(backend.process(1), ProcessResult::Error);
        assert_eq!(backend.process(2), ProcessResult::Error);
    }

    #[test]
    fn test_missing_path_errors_at_construction() {
        let mut backend = ClipBackend::new(
            Some(ClipSource::from_path("/nonexistent/clip.gif")),
            Mode::Gif,
            Arc::new(Clock::new()),
            10 * 1024 * 1024,
        );
        assert_eq!(backend.process(1), ProcessResult::Error);
    }
}
