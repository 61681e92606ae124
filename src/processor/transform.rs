use image::{DynamicImage, Rgba, RgbaImage};

/// The fill colour for the corners exposed by non right-angle rotations.
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Rotates the image clockwise by the given number of degrees.
///
/// Multiples of 90 are exact, any other angle is resampled onto a canvas
/// large enough to hold the whole rotated image.
pub fn rotate(img: &DynamicImage, degrees: i32) -> DynamicImage {
    match degrees.rem_euclid(360) {
        0 => img.clone(),
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        other => DynamicImage::ImageRgba8(rotate_expanded(&img.to_rgba8(), other as f64)),
    }
}

/// The dimensions of the smallest canvas that holds a `width` x `height`
/// image rotated by `degrees`.
pub fn rotated_bounds(width: u32, height: u32, degrees: f64) -> (u32, u32) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (w, h) = (width as f64, height as f64);

    let out_w = (w * cos.abs() + h * sin.abs()).round().max(1.0);
    let out_h = (w * sin.abs() + h * cos.abs()).round().max(1.0);

    (out_w as u32, out_h as u32)
}

fn rotate_expanded(src: &RgbaImage, degrees: f64) -> RgbaImage {
    let (width, height) = src.dimensions();
    let (out_w, out_h) = rotated_bounds(width, height, degrees);
    let (sin, cos) = degrees.to_radians().sin_cos();

    let (src_cx, src_cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let (dst_cx, dst_cy) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    RgbaImage::from_fn(out_w, out_h, |x, y| {
        let dx = x as f64 + 0.5 - dst_cx;
        let dy = y as f64 + 0.5 - dst_cy;

        // Inverse of a clockwise rotation with y pointing down.
        let sx = dx * cos + dy * sin + src_cx - 0.5;
        let sy = -dx * sin + dy * cos + src_cy - 0.5;

        sample_bilinear(src, sx, sy).unwrap_or(BACKGROUND)
    })
}

fn sample_bilinear(src: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    let (width, height) = src.dimensions();
    let (max_x, max_y) = ((width - 1) as f64, (height - 1) as f64);

    if x < -0.5 || y < -0.5 || x > max_x + 0.5 || y > max_y + 0.5 {
        return None;
    }

    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 4];
    for (c, channel) in out.iter_mut().enumerate() {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        *channel = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }

    Some(Rgba(out))
}
