use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::directive::{FitMode, OutputFormat};

static CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

/// The global runtime config.
///
/// Panics if `init` or `init_test` has not been called yet.
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get().expect("config not initialised")
}

#[cfg(test)]
pub fn init_test(data: &str) -> Result<()> {
    let cfg: RuntimeConfig = serde_yaml::from_str(data)?;
    cfg.validate()?;
    let _ = CONFIG.set(cfg);
    Ok(())
}

/// Loads the runtime config from the given file, or falls back
/// to the defaults if no file is given.
///
/// Files ending in `.json` are read as JSON, everything else as YAML.
pub async fn init(config_file: Option<&Path>) -> Result<()> {
    let cfg = match config_file {
        None => RuntimeConfig::default(),
        Some(path) => {
            let data = tokio::fs::read_to_string(path).await?;
            let is_json = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);

            if is_json {
                serde_json::from_str::<RuntimeConfig>(&data)?
            } else {
                serde_yaml::from_str::<RuntimeConfig>(&data)?
            }
        },
    };

    cfg.validate()?;
    let _ = CONFIG.set(cfg);

    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_static_dir")]
    /// The directory served as static files at the root of the server.
    ///
    /// Defaults to `public`.
    pub static_dir: PathBuf,

    #[serde(default = "default_index_file")]
    /// The file within `static_dir` served for `GET /`.
    ///
    /// Defaults to `app.html`.
    pub index_file: String,

    #[serde(default = "default_temp_dir")]
    /// The directory background removal inputs are staged in.
    ///
    /// This is created at startup if it does not exist.
    pub temp_dir: PathBuf,

    #[serde(default)]
    /// The maximum size of an uploaded image in bytes.
    ///
    /// If `None` uploads are unbounded.
    pub max_upload_size: Option<usize>,

    #[serde(default)]
    /// The maximum number of image jobs to run at once across
    /// both endpoints.
    ///
    /// If `None` this is only bounded by the worker pool.
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    /// The number of seconds a single image job may run for
    /// before the request is failed.
    pub processing_timeout: Option<u64>,

    #[serde(default)]
    /// The defaults used for any omitted optimisation fields.
    pub defaults: OptimizeDefaults,

    #[serde(default)]
    /// The segmentation model used by the background remover.
    ///
    /// If this is `None` background removal requests will fail.
    pub background_removal: Option<BackgroundRemovalConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
            index_file: default_index_file(),
            temp_dir: default_temp_dir(),
            max_upload_size: None,
            max_concurrency: None,
            processing_timeout: None,
            defaults: OptimizeDefaults::default(),
            background_removal: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.defaults.quality) {
            return Err(anyhow!(
                "defaults.quality must be between 1 and 100 inclusive, got {}",
                self.defaults.quality,
            ));
        }

        if self.max_concurrency == Some(0) {
            return Err(anyhow!("max_concurrency must be greater than 0"));
        }

        if let Some(bg) = self.background_removal.as_ref() {
            if bg.input_size == 0 {
                return Err(anyhow!("background_removal.input_size must be greater than 0"));
            }

            if bg.std.iter().any(|v| *v == 0.0) {
                return Err(anyhow!("background_removal.std must not contain zeros"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Deserialize)]
pub struct OptimizeDefaults {
    #[serde(default = "default_format")]
    /// The output format when none is requested.
    ///
    /// Defaults to `webp`.
    pub format: OutputFormat,

    #[serde(default = "default_quality")]
    /// The encoding quality when none is requested, from 1 to 100 inclusive.
    ///
    /// Defaults to `80`.
    pub quality: u8,

    #[serde(default = "default_fit")]
    /// The fit mode used when resizing and none is requested.
    ///
    /// Defaults to `inside`.
    pub fit: FitMode,
}

impl Default for OptimizeDefaults {
    fn default() -> Self {
        Self {
            format: default_format(),
            quality: default_quality(),
            fit: default_fit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundRemovalConfig {
    /// The path to the ONNX segmentation model.
    pub model: PathBuf,

    #[serde(default = "default_input_size")]
    /// The square input size the model expects.
    ///
    /// Defaults to `1024`.
    pub input_size: u32,

    #[serde(default = "default_mean")]
    /// The per channel (RGB) normalisation mean applied to `0.0..=1.0` pixels.
    pub mean: [f32; 3],

    #[serde(default = "default_std")]
    /// The per channel (RGB) normalisation standard deviation.
    pub std: [f32; 3],
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_index_file() -> String {
    "app.html".to_string()
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

const fn default_format() -> OutputFormat {
    OutputFormat::WebP
}

const fn default_quality() -> u8 {
    80
}

const fn default_fit() -> FitMode {
    FitMode::Inside
}

const fn default_input_size() -> u32 {
    1024
}

const fn default_mean() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

const fn default_std() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}
