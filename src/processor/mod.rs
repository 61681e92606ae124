use std::panic::{self, AssertUnwindSafe};

use anyhow::anyhow;
use bytes::Bytes;
use image::DynamicImage;
use tokio::sync::oneshot;

use crate::directive::OptimizeDirective;

pub mod encoder;
pub mod resizer;
pub mod transform;

pub use encoder::Encoding;

/// Runs a CPU bound job on the rayon pool without blocking the runtime.
///
/// A panicking job is turned into an error, rayon would otherwise abort
/// the process.
pub async fn spawn_cpu<F, T>(job: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    rayon::spawn(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(job))
            .unwrap_or_else(|payload| Err(anyhow!("worker panicked: {}", panic_message(&*payload))));

        // The receiver is gone if the request timed out or was dropped.
        let _ = tx.send(result);
    });

    rx.await
        .map_err(|_| anyhow!("worker dropped the job before completing it"))?
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Decodes the uploaded image, applies the directive and re-encodes it.
///
/// Operations are applied in a fixed order: rotate, resize, grayscale,
/// flip and finally flop. Rotating first means `width` and `height` always
/// bound the image as it is returned.
pub fn optimize(data: &[u8], directive: &OptimizeDirective) -> anyhow::Result<Bytes> {
    let img = decode(data)?;
    let img = apply(img, directive);

    encoder::encode(&img, Encoding::for_output(directive.format, directive.quality))
}

/// Decodes an upload, rejecting images without any pixels.
pub fn decode(data: &[u8]) -> anyhow::Result<DynamicImage> {
    let img = image::load_from_memory(data)?;
    ensure_not_empty(&img)?;
    Ok(img)
}

pub fn ensure_not_empty(img: &DynamicImage) -> anyhow::Result<()> {
    if img.width() == 0 || img.height() == 0 {
        return Err(anyhow!("decoded image is empty ({}x{})", img.width(), img.height()));
    }

    Ok(())
}

fn apply(mut img: DynamicImage, directive: &OptimizeDirective) -> DynamicImage {
    if let Some(angle) = directive.rotate {
        img = transform::rotate(&img, angle);
    }

    if directive.wants_resize() {
        img = resizer::resize(&img, directive.width, directive.height, directive.fit);
    }

    if directive.grayscale {
        img = img.grayscale();
    }

    if directive.flip {
        img = img.flipv();
    }

    if directive.flop {
        img = img.fliph();
    }

    img
}
