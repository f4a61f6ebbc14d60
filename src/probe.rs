// SPDX-License-Identifier: MPL-2.0

//! Stateless source probing for callers that need metadata without starting
//! playback, such as upload and attachment handling.

use image::RgbaImage;
use tracing::debug;

use crate::{
    decode::{Decoder, DecoderMode, GifClipDecoder},
    error::ClipError,
    prepare,
    types::{ClipSource, FrameRequest},
};

/// Metadata of a playable clip, plus a flattened cover frame.
#[derive(Debug)]
pub struct ClipMeta {
    /// Duration of one loop, in seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// First frame, flattened onto white when it carries alpha.
    pub cover: RgbaImage,
}

/// Open a source, pull its first frame and report duration and dimensions.
///
/// Returns [`ClipError::UnplayableDimensions`] when either side exceeds ten
/// times the other; such files should be treated as generic attachments, not
/// clips.
pub fn probe(source: &ClipSource) -> Result<ClipMeta, ClipError> {
    let mut decoder = GifClipDecoder::open(source, DecoderMode::OnlyGifv)?;
    decoder.read_next_frame()?;
    let frame = decoder.render_frame(None)?;
    let (width, height) = frame.image.dimensions();

    if width == 0 || height == 0 || width >= height * 10 || height >= width * 10 {
        return Err(ClipError::UnplayableDimensions { width, height });
    }

    let cover = if frame.has_alpha {
        let request = FrameRequest {
            frame_w: width,
            frame_h: height,
            outer_w: width,
            outer_h: height,
            factor: 1,
            rounded: false,
        };
        prepare::prepare_frame(&request, &frame.image, true, &mut None)
    } else {
        frame.image
    };

    let duration = decoder.duration()?;
    debug!(width, height, duration, "probed clip source");

    Ok(ClipMeta {
        duration,
        width,
        height,
        cover,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::encode_gif;

    #[test]
    fn test_reports_dimensions_and_duration() {
        let source = ClipSource::from_bytes(encode_gif(32, 24, 4, 5));
        let meta = probe(&source).unwrap();
        assert_eq!((meta.width, meta.height), (32, 24));
        assert_eq!(meta.cover.dimensions(), (32, 24));
        assert!((meta.duration - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_extreme_aspect_ratio_is_unplayable() {
        let source = ClipSource::from_bytes(encode_gif(200, 10, 1, 5));
        let err = probe(&source).unwrap_err();
        assert!(matches!(
            err,
            ClipError::UnplayableDimensions {
                width: 200,
                height: 10
            }
        ));
    }

    #[test]
    fn test_garbage_source_fails_to_open() {
        let source = ClipSource::from_bytes(b"garbage".to_vec());
        assert!(matches!(
            probe(&source),
            Err(ClipError::DecoderOpenFailed(_))
        ));
    }
}
