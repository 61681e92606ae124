use hashbrown::HashMap;
use poem::web::Multipart;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ApiError;

/// The name of the form field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// An uploaded image held entirely in memory.
#[derive(Debug)]
pub struct Upload {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// A parsed multipart form containing exactly one image.
#[derive(Debug)]
pub struct UploadForm {
    pub image: Upload,

    /// All non-image text fields keyed by name, values are kept verbatim.
    pub fields: HashMap<String, String>,
}

/// Reads the whole multipart body.
///
/// Fails with `ApiError::MissingImage` if there is no (or an empty) `image`
/// part, before any processing happens.
pub async fn read_form(
    mut multipart: Multipart,
    max_upload_size: Option<usize>,
) -> Result<UploadForm, ApiError> {
    let mut image = None;
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidUpload(format!("malformed multipart body: {}", e)))?
    {
        let name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };

        if name == IMAGE_FIELD {
            if image.is_some() {
                return Err(ApiError::InvalidUpload(
                    "only a single image may be uploaded per request".to_string(),
                ));
            }

            let content_type = field.content_type().map(|v| v.to_string());
            let file_name = field.file_name().map(|v| v.to_string());
            let reader = field.into_async_read();
            tokio::pin!(reader);
            let data = read_limited(reader, max_upload_size).await?;

            image = Some(Upload {
                data,
                content_type,
                file_name,
            });
            continue;
        }

        if field.file_name().is_some() {
            debug!("Ignoring unexpected file field {:?}", &name);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::InvalidUpload(format!("failed to read field {:?}: {}", &name, e)))?;
        fields.insert(name, value);
    }

    match image {
        Some(image) if !image.data.is_empty() => Ok(UploadForm { image, fields }),
        _ => Err(ApiError::MissingImage),
    }
}

/// Reads at most `limit + 1` bytes, anything past the limit is never buffered.
async fn read_limited<R>(mut reader: R, limit: Option<usize>) -> Result<Vec<u8>, ApiError>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let read = match limit {
        None => reader.read_to_end(&mut data).await,
        Some(limit) => reader.take(limit as u64 + 1).read_to_end(&mut data).await,
    };

    read.map_err(|e| ApiError::InvalidUpload(format!("failed to read image: {}", e)))?;

    match limit {
        Some(limit) if data.len() > limit => Err(ApiError::PayloadTooLarge { limit }),
        _ => Ok(data),
    }
}
