use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use thiserror::Error;

use crate::response::error_response;

/// Every way a request can fail.
///
/// The display text of each variant is the message sent to the client,
/// the source errors of the processing variants are only ever logged.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No image uploaded.")]
    MissingImage,

    #[error("{0}")]
    InvalidUpload(String),

    #[error("{0}")]
    InvalidDirective(String),

    #[error("unsupported output format {0:?}, expected one of jpeg, webp, png, avif, tiff or gif")]
    UnsupportedFormat(String),

    #[error("uploaded image exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Error processing image.")]
    Processing(#[source] anyhow::Error),

    #[error("Error removing background.")]
    BackgroundRemoval(#[source] anyhow::Error),

    #[error("Image processing timed out.")]
    Timeout,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingImage
            | Self::InvalidUpload(_)
            | Self::InvalidDirective(_)
            | Self::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Processing(_) | Self::BackgroundRemoval(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// A stable, machine readable name for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingImage => "missing_input",
            Self::InvalidUpload(_) => "invalid_upload",
            Self::InvalidDirective(_) => "invalid_directive",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Processing(_) | Self::BackgroundRemoval(_) => "processing_error",
            Self::Timeout => "timeout",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.kind(), self.to_string())
    }
}
