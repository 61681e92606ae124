use std::path::PathBuf;

use poem::endpoint::StaticFilesEndpoint;
use poem::middleware::{Cors, Tracing};
use poem::web::{Data, Multipart};
use poem::{handler, post, Endpoint, EndpointExt, IntoResponse, Response, Route};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::config;
use crate::controller::ImageController;
use crate::directive::OptimizeDirective;
use crate::error::ApiError;
use crate::response::image_response;
use crate::upload::read_form;

/// Constructs all the routes for the server.
///
/// The two processing routes take priority, every other path is resolved
/// against the static directory with `index_file` served for `/`.
pub fn build_app(controller: ImageController, static_dir: PathBuf, index_file: &str) -> impl Endpoint {
    Route::new()
        .at("/optimize", post(optimize))
        .at("/remove-bg", post(remove_bg))
        .nest("/", StaticFilesEndpoint::new(static_dir).index_file(index_file))
        .with(Cors::new())
        .with(Tracing)
        .data(controller)
}

/// Re-encode an image.
///
/// Takes a multipart form with an `image` file and any of the optional
/// `format`, `quality`, `width`, `height`, `fit`, `rotate`, `grayscale`,
/// `flip` and `flop` fields. The image is returned with the content type
/// `image/<format>`.
#[handler]
pub async fn optimize(controller: Data<&ImageController>, multipart: Multipart) -> Response {
    let span = info_span!("optimize", request_id = %Uuid::new_v4());

    async move {
        let form = read_form(multipart, config().max_upload_size).await?;
        let directive = OptimizeDirective::from_fields(&form.fields, &config().defaults)?;
        info!(
            ?directive,
            size = form.image.data.len(),
            file_name = ?form.image.file_name,
            content_type = ?form.image.content_type,
            "Optimizing image",
        );

        let content_type = directive.format.content_type();
        let optimized = controller.optimize(form.image, directive).await?;

        Ok::<_, ApiError>(image_response(&content_type, optimized))
    }
    .instrument(span)
    .await
    .unwrap_or_else(handle_error)
}

/// Remove the background of an image.
///
/// Takes a multipart form with an `image` file, the subject is returned on a
/// transparent background as a PNG.
#[handler]
pub async fn remove_bg(controller: Data<&ImageController>, multipart: Multipart) -> Response {
    let span = info_span!("remove_bg", request_id = %Uuid::new_v4());

    async move {
        let form = read_form(multipart, config().max_upload_size).await?;
        info!(
            size = form.image.data.len(),
            file_name = ?form.image.file_name,
            content_type = ?form.image.content_type,
            "Removing background",
        );

        let cutout = controller.remove_background(form.image).await?;
        info!("Background removal complete");

        Ok::<_, ApiError>(image_response(mime::IMAGE_PNG.as_ref(), cutout))
    }
    .instrument(span)
    .await
    .unwrap_or_else(handle_error)
}

fn handle_error(err: ApiError) -> Response {
    match &err {
        ApiError::Processing(cause) | ApiError::BackgroundRemoval(cause) => {
            error!("Failed to handle request: {:?}", cause);
        },
        ApiError::Timeout => warn!("Image processing timed out"),
        other => debug!("Rejected request: {}", other),
    }

    err.into_response()
}
