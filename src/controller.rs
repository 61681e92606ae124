use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::background::{self, BackgroundRemover};
use crate::directive::OptimizeDirective;
use crate::error::ApiError;
use crate::processor;
use crate::upload::Upload;

/// Owns everything a request needs to process an image.
///
/// This is cheap to clone and is shared across all requests.
#[derive(Clone)]
pub struct ImageController {
    remover: Arc<dyn BackgroundRemover>,
    temp_dir: Arc<PathBuf>,
    limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl ImageController {
    pub fn new(
        remover: Arc<dyn BackgroundRemover>,
        temp_dir: PathBuf,
        limiter: Option<Arc<Semaphore>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            remover,
            temp_dir: Arc::new(temp_dir),
            limiter,
            timeout,
        }
    }

    pub async fn optimize(&self, upload: Upload, directive: OptimizeDirective) -> Result<Bytes, ApiError> {
        let permit = self.permit().await?;

        let job = processor::spawn_cpu(move || {
            let _permit = permit;
            processor::optimize(&upload.data, &directive)
        });
        self.with_timeout(job)
            .await?
            .map_err(ApiError::Processing)
    }

    pub async fn remove_background(&self, upload: Upload) -> Result<Bytes, ApiError> {
        let permit = self.permit().await?;

        let remover = self.remover.clone();
        let temp_dir = self.temp_dir.clone();
        let job = processor::spawn_cpu(move || {
            let _permit = permit;
            background::remove_background(&*remover, &temp_dir, &upload.data)
        });

        self.with_timeout(job)
            .await?
            .map_err(ApiError::BackgroundRemoval)
    }

    /// Waits for a slot in the global limiter.
    ///
    /// The permit is moved into the job so it is held until the work is
    /// done, even if the request has already timed out.
    async fn permit(&self) -> Result<Option<OwnedSemaphorePermit>, ApiError> {
        let limiter = match self.limiter.as_ref() {
            None => return Ok(None),
            Some(limiter) => limiter,
        };

        limiter
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|e| ApiError::Processing(e.into()))
    }

    async fn with_timeout<T>(&self, job: impl Future<Output = T>) -> Result<T, ApiError> {
        match self.timeout {
            None => Ok(job.await),
            Some(limit) => tokio::time::timeout(limit, job)
                .await
                .map_err(|_| ApiError::Timeout),
        }
    }
}
