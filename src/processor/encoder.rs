use std::io::Cursor;

use anyhow::anyhow;
use bytes::Bytes;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageEncoder, ImageOutputFormat};

use crate::directive::OutputFormat;

/// The highest compression level accepted by the PNG encoder.
pub const MAX_PNG_COMPRESSION: u8 = 9;

/// The AVIF encoder speed, from 1 (slowest, smallest) to 10 (fastest).
const AVIF_SPEED: u8 = 6;

/// The concrete encoder settings for a requested format and quality.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Encoding {
    Jpeg { quality: u8, progressive: bool },
    WebP { quality: u8 },
    Png { quality: u8, compression_level: u8 },
    Avif { quality: u8 },
    Tiff { quality: u8 },
    Gif,
}

impl Encoding {
    /// Derives the encoder settings from the requested format and quality.
    pub fn for_output(format: OutputFormat, quality: u8) -> Self {
        match format {
            OutputFormat::Jpeg => Self::Jpeg { quality, progressive: true },
            OutputFormat::WebP => Self::WebP { quality },
            OutputFormat::Png => Self::Png {
                quality,
                compression_level: (quality / 10).min(MAX_PNG_COMPRESSION),
            },
            OutputFormat::Avif => Self::Avif {
                quality: quality.saturating_sub(10).max(1),
            },
            OutputFormat::Tiff => Self::Tiff { quality },
            OutputFormat::Gif => Self::Gif,
        }
    }
}

pub fn encode(img: &DynamicImage, encoding: Encoding) -> anyhow::Result<Bytes> {
    match encoding {
        Encoding::Jpeg { quality, progressive } => encode_jpeg(img, quality, progressive),
        Encoding::WebP { quality } => encode_webp(img, quality),
        Encoding::Png { compression_level, .. } => encode_png(img, compression_level),
        Encoding::Avif { quality } => encode_avif(img, quality),
        Encoding::Tiff { .. } => encode_to(img, ImageOutputFormat::Tiff),
        Encoding::Gif => encode_to(img, ImageOutputFormat::Gif),
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8, progressive: bool) -> anyhow::Result<Bytes> {
    let rgb = img.to_rgb8();
    let width = u16::try_from(rgb.width())
        .map_err(|_| anyhow!("image width {} is too large for jpeg", rgb.width()))?;
    let height = u16::try_from(rgb.height())
        .map_err(|_| anyhow!("image height {} is too large for jpeg", rgb.height()))?;

    let mut buff = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut buff, quality);
    encoder.set_progressive(progressive);
    encoder.encode(rgb.as_raw(), width, height, jpeg_encoder::ColorType::Rgb)?;

    Ok(Bytes::from(buff))
}

fn encode_webp(img: &DynamicImage, quality: u8) -> anyhow::Result<Bytes> {
    // libwebp only accepts 8 bit RGB(A) buffers.
    let img = if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    };

    let encoder = webp::Encoder::from_image(&img)
        .map_err(|e| anyhow!("failed to create webp encoder: {}", e))?;
    let encoded = encoder.encode(quality as f32);

    Ok(Bytes::from(encoded.to_vec()))
}

/// Encodes the image as a PNG with a compression level from 0 to 9.
pub fn encode_png(img: &DynamicImage, compression_level: u8) -> anyhow::Result<Bytes> {
    let img = to_8bit(img);
    let compression = match compression_level.min(MAX_PNG_COMPRESSION) {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    };

    let mut buff = Vec::new();
    PngEncoder::new_with_quality(&mut buff, compression, FilterType::Adaptive).write_image(
        img.as_bytes(),
        img.width(),
        img.height(),
        img.color(),
    )?;

    Ok(Bytes::from(buff))
}

fn encode_avif(img: &DynamicImage, quality: u8) -> anyhow::Result<Bytes> {
    let rgba = img.to_rgba8();
    let pixels: Vec<ravif::RGBA8> = rgba
        .pixels()
        .map(|p| ravif::RGBA8::new(p[0], p[1], p[2], p[3]))
        .collect();

    let encoded = ravif::Encoder::new()
        .with_quality(quality as f32)
        .with_alpha_quality(quality as f32)
        .with_speed(AVIF_SPEED)
        .encode_rgba(ravif::Img::new(
            pixels.as_slice(),
            rgba.width() as usize,
            rgba.height() as usize,
        ))
        .map_err(|e| anyhow!("failed to encode avif: {}", e))?;

    Ok(Bytes::from(encoded.avif_file))
}

#[inline]
fn encode_to(img: &DynamicImage, format: ImageOutputFormat) -> anyhow::Result<Bytes> {
    let mut buff = Cursor::new(Vec::new());
    to_rgb(img).write_to(&mut buff, format)?;
    Ok(Bytes::from(buff.into_inner()))
}

/// Narrows any high bit depth or float image down to 8 bits per channel.
fn to_8bit(img: &DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_) => img.clone(),
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Converts to 8 bit RGB(A), the gif and tiff encoders reject grey images.
fn to_rgb(img: &DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img.clone(),
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}
