use std::str::FromStr;

use hashbrown::HashMap;
use serde::Deserialize;
use strum::{AsRefStr, Display, EnumString};

use crate::config::OptimizeDefaults;
use crate::error::ApiError;

/// The set of formats an image can be re-encoded to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    WebP,
    Png,
    Avif,
    Tiff,
    Gif,
}

impl OutputFormat {
    /// The content type the encoded image is served with.
    pub fn content_type(&self) -> String {
        format!("image/{}", self.as_ref())
    }
}

/// How an image is fitted to the requested width and height.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FitMode {
    /// Scale to cover both dimensions then crop the overflow.
    Cover,

    /// Scale to fit within both dimensions then letterbox.
    Contain,

    /// Stretch to the exact dimensions ignoring the aspect ratio.
    Fill,

    /// Scale to fit within both dimensions.
    Inside,

    /// Scale to cover both dimensions without cropping.
    Outside,
}

/// The transformations requested for a single `/optimize` call.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeDirective {
    pub format: OutputFormat,
    pub quality: u8,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: FitMode,
    pub rotate: Option<i32>,
    pub grayscale: bool,
    pub flip: bool,
    pub flop: bool,
}

impl OptimizeDirective {
    /// Builds a directive from the text fields of an upload form.
    ///
    /// Omitted or empty fields fall back to the given defaults. The boolean
    /// flags are only set when their value is exactly `"true"`.
    pub fn from_fields(
        fields: &HashMap<String, String>,
        defaults: &OptimizeDefaults,
    ) -> Result<Self, ApiError> {
        let format = match field(fields, "format") {
            None => defaults.format,
            Some(v) => OutputFormat::from_str(v)
                .map_err(|_| ApiError::UnsupportedFormat(v.to_string()))?,
        };

        let quality = match field(fields, "quality") {
            None => defaults.quality,
            Some(v) => parse_int(v)
                .ok_or_else(|| invalid("quality", v))?
                .clamp(1, 100) as u8,
        };

        let fit = match field(fields, "fit") {
            None => defaults.fit,
            Some(v) => FitMode::from_str(v).map_err(|_| {
                ApiError::InvalidDirective(format!(
                    "fit must be one of cover, contain, fill, inside or outside, got {:?}",
                    v,
                ))
            })?,
        };

        let width = parse_dimension(fields, "width")?;
        let height = parse_dimension(fields, "height")?;

        let rotate = match field(fields, "rotate") {
            None => None,
            Some(v) => {
                let angle = parse_int(v)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| invalid("rotate", v))?;

                if angle == 0 { None } else { Some(angle) }
            },
        };

        Ok(Self {
            format,
            quality,
            width,
            height,
            fit,
            rotate,
            grayscale: is_true(fields, "grayscale"),
            flip: is_true(fields, "flip"),
            flop: is_true(fields, "flop"),
        })
    }

    #[inline]
    pub fn wants_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

fn is_true(fields: &HashMap<String, String>, name: &str) -> bool {
    fields.get(name).map(|v| v == "true").unwrap_or(false)
}

fn invalid(name: &str, value: &str) -> ApiError {
    ApiError::InvalidDirective(format!("{} must be an integer, got {:?}", name, value))
}

/// Parses a width or height, a value of `0` means unconstrained.
fn parse_dimension(fields: &HashMap<String, String>, name: &str) -> Result<Option<u32>, ApiError> {
    let value = match field(fields, name) {
        None => return Ok(None),
        Some(v) => v,
    };

    let parsed = parse_int(value).ok_or_else(|| invalid(name, value))?;
    if parsed == 0 {
        return Ok(None);
    }

    u32::try_from(parsed)
        .map(Some)
        .map_err(|_| {
            ApiError::InvalidDirective(format!(
                "{} must be a positive integer, got {:?}",
                name, value,
            ))
        })
}

/// Parses the leading integer of a string.
///
/// Leading whitespace and a single sign are accepted and anything after
/// the leading digits is ignored, so `" 80px"` yields `80`.
/// Returns `None` if there are no leading digits or the value overflows.
pub fn parse_int(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }

    let magnitude = rest[..end].parse::<i64>().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}
