use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use image::io::Reader;
use image::{DynamicImage, RgbaImage};
use tempfile::NamedTempFile;

use crate::config::BackgroundRemovalConfig;
use crate::processor::{self, encoder::{encode_png, MAX_PNG_COMPRESSION}};

mod tract;

pub use self::tract::TractRemover;

/// The prefix of every staged background removal input.
pub const TEMP_INPUT_PREFIX: &str = "temp_input_";

/// Separates the subject of an image from its background.
pub trait BackgroundRemover: Sync + Send + 'static {
    /// Returns the image with every background pixel made transparent.
    fn remove_background(&self, img: &DynamicImage) -> anyhow::Result<RgbaImage>;
}

/// The remover used when no segmentation model is configured.
pub struct DisabledRemover;

impl BackgroundRemover for DisabledRemover {
    fn remove_background(&self, _img: &DynamicImage) -> anyhow::Result<RgbaImage> {
        Err(anyhow!("background removal is not configured, no segmentation model was given"))
    }
}

/// Builds the remover for the given config, loading the model if one is set.
pub fn connect(cfg: Option<&BackgroundRemovalConfig>) -> anyhow::Result<Arc<dyn BackgroundRemover>> {
    match cfg {
        Some(cfg) => Ok(Arc::new(TractRemover::load(cfg)?)),
        None => {
            warn!("No background removal model configured, /remove-bg requests will fail");
            Ok(Arc::new(DisabledRemover))
        },
    }
}

/// Writes the upload to a uniquely named file in `dir`.
///
/// The file is removed when the returned handle is dropped.
pub fn stage_input(dir: &Path, data: &[u8]) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_INPUT_PREFIX)
        .tempfile_in(dir)?;

    file.write_all(data)?;
    file.flush()?;

    Ok(file)
}

/// Stages the upload on disk, removes the background of the image
/// and encodes the result as a lossless PNG.
pub fn remove_background(
    remover: &dyn BackgroundRemover,
    temp_dir: &Path,
    data: &[u8],
) -> anyhow::Result<Bytes> {
    let staged = stage_input(temp_dir, data)?;
    debug!("Staged background removal input @ {:?}", staged.path());

    let encoded = remove_from_file(remover, staged.path())?;
    staged.close()?;

    Ok(encoded)
}

fn remove_from_file(remover: &dyn BackgroundRemover, path: &Path) -> anyhow::Result<Bytes> {
    let img = Reader::open(path)?
        .with_guessed_format()?
        .decode()?;
    processor::ensure_not_empty(&img)?;

    let cutout = remover.remove_background(&img)?;
    encode_png(&DynamicImage::ImageRgba8(cutout), MAX_PNG_COMPRESSION)
}

/// Applies the given mask as the alpha channel of the image.
///
/// Pixels with a zero mask value are cleared to fully transparent black.
pub fn apply_mask(img: &DynamicImage, mask: &image::GrayImage) -> RgbaImage {
    let mut rgba = img.to_rgba8();

    for (x, y, pixel) in rgba.enumerate_pixels_mut() {
        let alpha = mask.get_pixel(x, y)[0];
        if alpha == 0 {
            *pixel = image::Rgba([0, 0, 0, 0]);
        } else {
            pixel[3] = alpha;
        }
    }

    rgba
}
