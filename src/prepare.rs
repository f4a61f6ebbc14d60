// SPDX-License-Identifier: MPL-2.0

//! Frame preparation: resize, letterbox, alpha flatten and corner rounding.
//!
//! Turns a raw decoded frame into a device-ready pixmap matching a
//! [`FrameRequest`]: the frame is drawn centered into the outer canvas,
//! letterbox bars are filled black, frames with alpha are flattened onto
//! white, and an optional rounded-corner mask is applied.

use image::{imageops::FilterType, DynamicImage, Rgba, RgbaImage};

use crate::types::{FrameRequest, ROUNDED_RADIUS};

const BAR_FILL: Rgba<u8> = Rgba([0, 0, 0, 255]);
const ALPHA_FILL: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Whether [`prepare_frame`] would change anything for this input. When it
/// would not, the original image can be shown as-is.
pub(crate) fn needs_preparation(
    request: &FrameRequest,
    original_size: (u32, u32),
    has_alpha: bool,
) -> bool {
    let bad_size = original_size != (request.frame_w, request.frame_h);
    let needs_outer =
        (request.outer_w, request.outer_h) != (request.frame_w, request.frame_h);
    bad_size || needs_outer || has_alpha || request.rounded
}

/// Produce the device-ready pixmap for `request` from a decoded frame.
///
/// `scratch` is a reusable canvas: when it holds an image of the right size
/// its allocation is recycled, matching the per-call cache the consumer keeps
/// while re-preparing on resize.
pub(crate) fn prepare_frame(
    request: &FrameRequest,
    original: &RgbaImage,
    has_alpha: bool,
    scratch: &mut Option<RgbaImage>,
) -> RgbaImage {
    if !needs_preparation(request, original.dimensions(), has_alpha) {
        return original.clone();
    }

    let mut canvas = match scratch.take() {
        Some(image) if image.dimensions() == (request.outer_w, request.outer_h) => image,
        _ => RgbaImage::new(request.outer_w, request.outer_h),
    };
    for pixel in canvas.pixels_mut() {
        *pixel = BAR_FILL;
    }

    let left = (request.outer_w.saturating_sub(request.frame_w)) / 2;
    let top = (request.outer_h.saturating_sub(request.frame_h)) / 2;

    if has_alpha {
        for y in top..(top + request.frame_h).min(request.outer_h) {
            for x in left..(left + request.frame_w).min(request.outer_w) {
                canvas.put_pixel(x, y, ALPHA_FILL);
            }
        }
    }

    let sized;
    let frame = if original.dimensions() == (request.frame_w, request.frame_h) {
        original
    } else {
        sized = resize(
            &DynamicImage::ImageRgba8(original.clone()),
            request.frame_w,
            request.frame_h,
        )
        .into_rgba8();
        &sized
    };

    if has_alpha {
        image::imageops::overlay(&mut canvas, frame, i64::from(left), i64::from(top));
    } else {
        image::imageops::replace(&mut canvas, frame, i64::from(left), i64::from(top));
    }

    if request.rounded {
        round_corners(&mut canvas, ROUNDED_RADIUS * request.factor);
    }

    canvas
}

/// Resize with `fast_image_resize`, falling back to `image` on failure.
pub(crate) fn resize(img: &DynamicImage, new_width: u32, new_height: u32) -> DynamicImage {
    let mut resizer = fast_image_resize::Resizer::new();
    let options = fast_image_resize::ResizeOptions {
        algorithm: fast_image_resize::ResizeAlg::Convolution(
            fast_image_resize::FilterType::Lanczos3,
        ),
        ..Default::default()
    };
    let mut new_image = image::DynamicImage::new(new_width, new_height, img.color());
    if let Err(err) = resizer.resize(img, &mut new_image, &options) {
        tracing::warn!(?err, "Failed to use `fast_image_resize`. Falling back.");
        new_image =
            image::imageops::resize(img, new_width, new_height, FilterType::Lanczos3).into();
    }
    new_image
}

/// Clear the alpha of every pixel outside a rounded rectangle of the image.
fn round_corners(image: &mut RgbaImage, radius: u32) {
    let (width, height) = image.dimensions();
    let radius = radius.min(width / 2).min(height / 2);
    if radius == 0 {
        return;
    }
    let r = radius as f32;
    for dy in 0..radius {
        for dx in 0..radius {
            let x = dx as f32 + 0.5;
            let y = dy as f32 + 0.5;
            if (r - x) * (r - x) + (r - y) * (r - y) <= r * r {
                continue;
            }
            for (px, py) in [
                (dx, dy),
                (width - 1 - dx, dy),
                (dx, height - 1 - dy),
                (width - 1 - dx, height - 1 - dy),
            ] {
                image.put_pixel(px, py, Rgba([0, 0, 0, 0]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frame: (u32, u32), outer: (u32, u32)) -> FrameRequest {
        FrameRequest {
            frame_w: frame.0,
            frame_h: frame.1,
            outer_w: outer.0,
            outer_h: outer.1,
            factor: 1,
            rounded: false,
        }
    }

    fn solid(width: u32, height: u32, pixel: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(pixel))
    }

    #[test]
    fn test_identity_needs_no_preparation() {
        let request = request((8, 8), (8, 8));
        assert!(!needs_preparation(&request, (8, 8), false));
        let original = solid(8, 8, [10, 20, 30, 255]);
        let prepared = prepare_frame(&request, &original, false, &mut None);
        assert_eq!(prepared, original);
    }

    #[test]
    fn test_alpha_forces_preparation() {
        let request = request((8, 8), (8, 8));
        assert!(needs_preparation(&request, (8, 8), true));
    }

    #[test]
    fn test_letterbox_bars_are_black() {
        let request = request((4, 4), (8, 4));
        let original = solid(4, 4, [200, 0, 0, 255]);
        let prepared = prepare_frame(&request, &original, false, &mut None);
        assert_eq!(prepared.dimensions(), (8, 4));
        // bars on both sides
        assert_eq!(*prepared.get_pixel(0, 2), BAR_FILL);
        assert_eq!(*prepared.get_pixel(7, 2), BAR_FILL);
        // frame centered
        assert_eq!(*prepared.get_pixel(3, 2), Rgba([200, 0, 0, 255]));
    }

    #[test]
    fn test_alpha_frames_flatten_onto_white() {
        let request = request((4, 4), (4, 4));
        let original = solid(4, 4, [0, 0, 0, 0]);
        let prepared = prepare_frame(&request, &original, true, &mut None);
        assert_eq!(*prepared.get_pixel(2, 2), ALPHA_FILL);
    }

    #[test]
    fn test_undersized_original_is_scaled_up() {
        let request = request((8, 8), (8, 8));
        let original = solid(4, 4, [0, 128, 0, 255]);
        let prepared = prepare_frame(&request, &original, false, &mut None);
        assert_eq!(prepared.dimensions(), (8, 8));
        assert_eq!(prepared.get_pixel(4, 4).0[1], 128);
    }

    #[test]
    fn test_rounded_mask_clears_corners() {
        let mut req = request((16, 16), (16, 16));
        req.rounded = true;
        let original = solid(16, 16, [50, 50, 50, 255]);
        let prepared = prepare_frame(&req, &original, false, &mut None);
        assert_eq!(prepared.get_pixel(0, 0).0[3], 0);
        assert_eq!(prepared.get_pixel(15, 0).0[3], 0);
        assert_eq!(prepared.get_pixel(0, 15).0[3], 0);
        assert_eq!(prepared.get_pixel(15, 15).0[3], 0);
        // center untouched
        assert_eq!(prepared.get_pixel(8, 8).0[3], 255);
    }

    #[test]
    fn test_scratch_allocation_is_recycled() {
        let request = request((4, 4), (8, 8));
        let original = solid(4, 4, [1, 2, 3, 255]);
        let mut scratch = Some(RgbaImage::new(8, 8));
        let prepared = prepare_frame(&request, &original, false, &mut scratch);
        assert!(scratch.is_none());
        assert_eq!(prepared.dimensions(), (8, 8));
    }
}
