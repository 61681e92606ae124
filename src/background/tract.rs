use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use tract_onnx::prelude::*;

use super::{apply_mask, BackgroundRemover};
use crate::config::BackgroundRemovalConfig;

type Model = TypedRunnableModel<TypedModel>;

/// Removes backgrounds with a single input, single mask output ONNX
/// segmentation model (ISNet and friends) using the pure Rust tract runtime.
///
/// The model is expected to take a `1x3xSxS` normalised RGB tensor and
/// produce a `1x1xSxS` foreground probability mask in `0.0..=1.0`.
pub struct TractRemover {
    model: Model,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl TractRemover {
    pub fn load(cfg: &BackgroundRemovalConfig) -> anyhow::Result<Self> {
        let start = Instant::now();
        let size = cfg.input_size as usize;

        let model = tract_onnx::onnx()
            .model_for_path(&cfg.model)
            .map_err(|e| anyhow::anyhow!("failed to load model {:?}: {}", &cfg.model, e))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())?
            .into_optimized()?
            .into_runnable()?;

        info!(
            "Loaded segmentation model {:?} in {:?}",
            &cfg.model,
            start.elapsed(),
        );

        Ok(Self {
            model,
            input_size: cfg.input_size,
            mean: cfg.mean,
            std: cfg.std,
        })
    }

    fn to_tensor(&self, img: &DynamicImage) -> Tensor {
        let size = self.input_size;
        let resized = imageops::resize(&img.to_rgb8(), size, size, FilterType::Triangle);

        let (mean, std) = (self.mean, self.std);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| {
                let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                (value - mean[c]) / std[c]
            },
        )
        .into()
    }

    fn to_mask(&self, output: &Tensor, width: u32, height: u32) -> anyhow::Result<GrayImage> {
        let view = output
            .to_array_view::<f32>()?
            .into_dimensionality::<tract_ndarray::Ix4>()?;

        let (_, _, mask_h, mask_w) = view.dim();
        let mask = GrayImage::from_fn(mask_w as u32, mask_h as u32, |x, y| {
            let value = view[[0, 0, y as usize, x as usize]].clamp(0.0, 1.0);
            image::Luma([(value * 255.0).round() as u8])
        });

        Ok(imageops::resize(&mask, width, height, FilterType::Triangle))
    }
}

impl BackgroundRemover for TractRemover {
    fn remove_background(&self, img: &DynamicImage) -> anyhow::Result<RgbaImage> {
        let start = Instant::now();

        let outputs = self.model.run(tvec!(self.to_tensor(img).into()))?;
        let output = outputs
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("segmentation model produced no outputs"))?;

        let mask = self.to_mask(output, img.width(), img.height())?;
        debug!("Segmented {}x{} image in {:?}", img.width(), img.height(), start.elapsed());

        Ok(apply_mask(img, &mask))
    }
}
