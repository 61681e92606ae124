use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};

use crate::directive::FitMode;

/// The canvas colour used when letterboxing with `FitMode::Contain`.
const LETTERBOX: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Resizes the image to the requested dimensions following the fit mode.
///
/// Images are never enlarged, if either scale factor would grow the image it is
/// clamped to `1.0` so no output dimension exceeds the original.
pub fn resize(
    img: &DynamicImage,
    width: Option<u32>,
    height: Option<u32>,
    fit: FitMode,
) -> DynamicImage {
    let (src_w, src_h) = (img.width(), img.height());

    let (target_w, target_h) = match (width, height) {
        (None, None) => return img.clone(),
        (Some(w), None) => {
            let scale = (w as f64 / src_w as f64).min(1.0);
            return scale_by(img, scale, scale);
        },
        (None, Some(h)) => {
            let scale = (h as f64 / src_h as f64).min(1.0);
            return scale_by(img, scale, scale);
        },
        (Some(w), Some(h)) => (w, h),
    };

    let scale_x = target_w as f64 / src_w as f64;
    let scale_y = target_h as f64 / src_h as f64;

    match fit {
        FitMode::Inside => {
            let scale = scale_x.min(scale_y).min(1.0);
            scale_by(img, scale, scale)
        },
        FitMode::Outside => {
            let scale = scale_x.max(scale_y).min(1.0);
            scale_by(img, scale, scale)
        },
        FitMode::Fill => scale_by(img, scale_x.min(1.0), scale_y.min(1.0)),
        FitMode::Cover => {
            let scale = scale_x.max(scale_y).min(1.0);
            let resized = scale_by(img, scale, scale);

            let crop_w = target_w.min(resized.width());
            let crop_h = target_h.min(resized.height());
            let x = (resized.width() - crop_w) / 2;
            let y = (resized.height() - crop_h) / 2;

            resized.crop_imm(x, y, crop_w, crop_h)
        },
        FitMode::Contain => {
            let scale = scale_x.min(scale_y).min(1.0);
            let resized = scale_by(img, scale, scale);

            let canvas_w = target_w.min(src_w);
            let canvas_h = target_h.min(src_h);
            if canvas_w == resized.width() && canvas_h == resized.height() {
                return resized;
            }

            let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, LETTERBOX);
            let x = (canvas_w - resized.width()) / 2;
            let y = (canvas_h - resized.height()) / 2;
            imageops::overlay(&mut canvas, &resized.to_rgba8(), x as i64, y as i64);

            DynamicImage::ImageRgba8(canvas)
        },
    }
}

fn scale_by(img: &DynamicImage, scale_x: f64, scale_y: f64) -> DynamicImage {
    let w = scaled(img.width(), scale_x);
    let h = scaled(img.height(), scale_y);

    if w == img.width() && h == img.height() {
        return img.clone();
    }

    img.resize_exact(w, h, FilterType::Lanczos3)
}

#[inline]
fn scaled(dimension: u32, scale: f64) -> u32 {
    ((dimension as f64 * scale).round() as u32).clamp(1, dimension.max(1))
}
