// SPDX-License-Identifier: MPL-2.0

//! Decoder capability consumed by the engine, and its built-in GIF
//! implementation.
//!
//! The engine itself only drives the [`Decoder`] trait: pull the next frame,
//! render it at a target size, ask how long to show it. The bundled
//! [`GifClipDecoder`] decodes GIF sources one frame at a time, compositing
//! indexed frames onto a persistent canvas and looping back to the first
//! frame at end of stream.

use std::{
    fs::File,
    io::{BufReader, Cursor, Read},
};

use image::{DynamicImage, Rgba, RgbaImage};
use tracing::debug;

use crate::{
    error::ClipError,
    prepare,
    types::{ClipSource, DEFAULT_FRAME_DELAY_MS},
};

/// Decoder open mode.
///
/// `Silent` is used for looping animations, `Normal` for clips whose audio is
/// handled upstream, `OnlyGifv` for metadata probing. The built-in GIF
/// decoder treats all three alike; plugged-in decoders may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    Normal,
    Silent,
    OnlyGifv,
}

/// A frame rendered to pixels.
pub struct DecodedFrame {
    pub image: RgbaImage,
    pub has_alpha: bool,
}

/// The decode capability a clip backend drives.
pub trait Decoder: Send {
    /// Demux and decode the next frame, looping at end of stream.
    fn read_next_frame(&mut self) -> Result<(), ClipError>;

    /// Render the current frame. `None` or `(0, 0)` means native size.
    fn render_frame(&mut self, target: Option<(u32, u32)>) -> Result<DecodedFrame, ClipError>;

    /// How long the current frame should be shown, in milliseconds. The
    /// engine clamps this to at least 5 ms.
    fn next_frame_delay(&self) -> u64;

    /// Total duration of one loop, in seconds.
    fn duration(&self) -> Result<f64, ClipError>;
}

/// Open the built-in decoder for a source.
pub(crate) fn open_decoder(
    source: &ClipSource,
    mode: DecoderMode,
) -> Result<Box<dyn Decoder>, ClipError> {
    Ok(Box::new(GifClipDecoder::open(source, mode)?))
}

/// Streaming GIF decoder.
///
/// Frames are composited onto a persistent canvas so partial frames and
/// transparency accumulate correctly; `DisposalMethod::Background` clears the
/// frame rectangle before the next composite, `Previous` is treated as keep.
pub struct GifClipDecoder {
    source: ClipSource,
    reader: gif::Decoder<Box<dyn Read + Send>>,
    global_palette: Option<Vec<u8>>,
    canvas: RgbaImage,
    /// Rectangle to clear before the next frame composites.
    pending_clear: Option<(u32, u32, u32, u32)>,
    frame_delay_ms: u64,
    transparency_seen: bool,
}

impl std::fmt::Debug for GifClipDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GifClipDecoder")
            .field("source", &self.source)
            .field("global_palette", &self.global_palette)
            .field("canvas", &self.canvas)
            .field("pending_clear", &self.pending_clear)
            .field("frame_delay_ms", &self.frame_delay_ms)
            .field("transparency_seen", &self.transparency_seen)
            .finish()
    }
}

impl GifClipDecoder {
    pub fn open(source: &ClipSource, mode: DecoderMode) -> Result<Self, ClipError> {
        let (reader, global_palette) = open_reader(source)?;
        let canvas = RgbaImage::new(u32::from(reader.width()), u32::from(reader.height()));
        debug!(
            ?mode,
            width = canvas.width(),
            height = canvas.height(),
            "opened gif source"
        );
        Ok(Self {
            source: source.clone(),
            reader,
            global_palette,
            canvas,
            pending_clear: None,
            frame_delay_ms: DEFAULT_FRAME_DELAY_MS,
            transparency_seen: false,
        })
    }

    fn apply_pending_clear(&mut self) {
        if let Some((x0, y0, w, h)) = self.pending_clear.take() {
            let (canvas_width, canvas_height) = self.canvas.dimensions();
            for y in y0..(y0 + h).min(canvas_height) {
                for x in x0..(x0 + w).min(canvas_width) {
                    self.canvas.put_pixel(x, y, Rgba([0, 0, 0, 0]));
                }
            }
            self.transparency_seen = true;
        }
    }

    /// Composite the next frame onto the canvas. `Ok(false)` at end of
    /// stream.
    fn composite_next(&mut self) -> Result<bool, ClipError> {
        let Self {
            reader,
            global_palette,
            canvas,
            pending_clear,
            frame_delay_ms,
            transparency_seen,
            ..
        } = self;

        let frame = match reader.read_next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(false),
            Err(err) => return Err(ClipError::DecodeFailed(err.to_string())),
        };

        let frame_width = u32::from(frame.width);
        let frame_height = u32::from(frame.height);
        let frame_x = u32::from(frame.left);
        let frame_y = u32::from(frame.top);
        let (canvas_width, canvas_height) = canvas.dimensions();

        let palette = frame
            .palette
            .as_ref()
            .or(global_palette.as_ref())
            .ok_or_else(|| ClipError::DecodeFailed("no palette for gif frame".into()))?;
        let transparent_idx = frame.transparent;
        if transparent_idx.is_some()
            || frame_width < canvas_width
            || frame_height < canvas_height
        {
            *transparency_seen = true;
        }

        for (i, &pixel_idx) in frame.buffer.iter().enumerate() {
            if Some(pixel_idx) == transparent_idx {
                continue;
            }
            let x = (i as u32 % frame_width) + frame_x;
            let y = (i as u32 / frame_width) + frame_y;
            if x < canvas_width && y < canvas_height {
                let base = pixel_idx as usize * 3;
                if base + 2 < palette.len() {
                    canvas.put_pixel(
                        x,
                        y,
                        Rgba([palette[base], palette[base + 1], palette[base + 2], 255]),
                    );
                }
            }
        }

        // GIF delay is in centiseconds; zero means "as fast as possible" and
        // gets a 100 ms default.
        *frame_delay_ms = if frame.delay == 0 {
            DEFAULT_FRAME_DELAY_MS
        } else {
            u64::from(frame.delay) * 10
        };

        if frame.dispose == gif::DisposalMethod::Background {
            *pending_clear = Some((frame_x, frame_y, frame_width, frame_height));
        }

        Ok(true)
    }

    /// Re-open the source to loop back to the first frame.
    fn rewind(&mut self) -> Result<(), ClipError> {
        let (reader, global_palette) = open_reader(&self.source)?;
        self.reader = reader;
        self.global_palette = global_palette;
        let (width, height) = self.canvas.dimensions();
        self.canvas = RgbaImage::new(width, height);
        self.pending_clear = None;
        Ok(())
    }
}

impl Decoder for GifClipDecoder {
    fn read_next_frame(&mut self) -> Result<(), ClipError> {
        self.apply_pending_clear();
        if self.composite_next()? {
            return Ok(());
        }
        self.rewind()?;
        if self.composite_next()? {
            return Ok(());
        }
        Err(ClipError::DecodeFailed("gif has no frames".into()))
    }

    fn render_frame(&mut self, target: Option<(u32, u32)>) -> Result<DecodedFrame, ClipError> {
        let native = self.canvas.dimensions();
        if native.0 == 0 || native.1 == 0 {
            return Err(ClipError::RenderFailed("gif canvas is empty".into()));
        }
        let image = match target {
            None | Some((0, 0)) => self.canvas.clone(),
            Some(size) if size == native => self.canvas.clone(),
            Some((width, height)) => {
                prepare::resize(
                    &DynamicImage::ImageRgba8(self.canvas.clone()),
                    width,
                    height,
                )
                .into_rgba8()
            }
        };
        Ok(DecodedFrame {
            image,
            has_alpha: self.transparency_seen,
        })
    }

    fn next_frame_delay(&self) -> u64 {
        self.frame_delay_ms
    }

    fn duration(&self) -> Result<f64, ClipError> {
        let (mut reader, _) = open_reader(&self.source)?;
        let mut total_ms = 0u64;
        loop {
            match reader.read_next_frame() {
                Ok(Some(frame)) => {
                    total_ms += if frame.delay == 0 {
                        DEFAULT_FRAME_DELAY_MS
                    } else {
                        u64::from(frame.delay) * 10
                    };
                }
                Ok(None) => break,
                Err(err) => return Err(ClipError::DecodeFailed(err.to_string())),
            }
        }
        Ok(total_ms as f64 / 1000.0)
    }
}

type GifReader = gif::Decoder<Box<dyn Read + Send>>;

fn open_reader(source: &ClipSource) -> Result<(GifReader, Option<Vec<u8>>), ClipError> {
    let read: Box<dyn Read + Send> = match source {
        ClipSource::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
        ClipSource::Path(path) => Box::new(BufReader::new(File::open(path).map_err(|err| {
            ClipError::SourceUnavailable(format!("{}: {err}", path.display()))
        })?)),
    };
    let reader = gif::DecodeOptions::new()
        .read_info(read)
        .map_err(|err| ClipError::DecoderOpenFailed(err.to_string()))?;
    let global_palette = reader.palette().ok().map(<[u8]>::to_vec);
    Ok((reader, global_palette))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::encode_gif;

    fn memory(bytes: Vec<u8>) -> ClipSource {
        ClipSource::from_bytes(bytes)
    }

    #[test]
    fn test_decodes_first_frame_at_native_size() {
        let source = memory(encode_gif(20, 10, 3, 4));
        let mut decoder = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap();
        decoder.read_next_frame().unwrap();
        let frame = decoder.render_frame(None).unwrap();
        assert_eq!(frame.image.dimensions(), (20, 10));
        assert_eq!(decoder.next_frame_delay(), 40);
    }

    #[test]
    fn test_zero_delay_gets_the_default() {
        let source = memory(encode_gif(4, 4, 2, 0));
        let mut decoder = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap();
        decoder.read_next_frame().unwrap();
        assert_eq!(decoder.next_frame_delay(), DEFAULT_FRAME_DELAY_MS);
    }

    #[test]
    fn test_loops_past_the_last_frame() {
        let source = memory(encode_gif(4, 4, 2, 3));
        let mut decoder = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap();
        for _ in 0..7 {
            decoder.read_next_frame().unwrap();
        }
        let frame = decoder.render_frame(None).unwrap();
        assert_eq!(frame.image.dimensions(), (4, 4));
    }

    #[test]
    fn test_render_scales_to_target() {
        let source = memory(encode_gif(16, 16, 1, 5));
        let mut decoder = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap();
        decoder.read_next_frame().unwrap();
        let frame = decoder.render_frame(Some((8, 8))).unwrap();
        assert_eq!(frame.image.dimensions(), (8, 8));
    }

    #[test]
    fn test_duration_sums_frame_delays() {
        let source = memory(encode_gif(4, 4, 5, 10));
        let decoder = GifClipDecoder::open(&source, DecoderMode::OnlyGifv).unwrap();
        let duration = decoder.duration().unwrap();
        assert!((duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_bytes_fail_to_open() {
        let source = memory(b"definitely not a gif".to_vec());
        let err = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap_err();
        assert!(matches!(err, ClipError::DecoderOpenFailed(_)));
    }

    #[test]
    fn test_missing_file_is_source_unavailable() {
        let source = ClipSource::from_path("/nonexistent/clip.gif");
        let err = GifClipDecoder::open(&source, DecoderMode::Silent).unwrap_err();
        assert!(matches!(err, ClipError::SourceUnavailable(_)));
    }
}
