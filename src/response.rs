use bytes::Bytes;
use poem::http::StatusCode;
use poem::web::Json;
use poem::{IntoResponse, Response};
use serde::Serialize;

/// The body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub kind: &'static str,
    pub message: String,
}

/// A standard JSON error response with the content type set to application/json.
pub fn error_response(status: StatusCode, kind: &'static str, message: String) -> Response {
    let payload = ErrorBody {
        status: status.as_u16(),
        kind,
        message,
    };

    Json(payload)
        .with_status(status)
        .into_response()
}

pub fn image_response(content_type: &str, data: impl Into<Bytes>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .content_type(content_type)
        .body(data.into())
}
