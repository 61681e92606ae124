use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, Rgb, RgbImage, RgbaImage};
use poem::http::StatusCode;
use poem::test::{TestClient, TestResponse};
use poem::Endpoint;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::background::{apply_mask, BackgroundRemover, DisabledRemover};
use crate::config;
use crate::controller::ImageController;

const TEST_CONFIG: &str = r#"
max_upload_size: 1048576
max_concurrency: 4
processing_timeout: 30
defaults:
  format: webp
  quality: 80
  fit: inside
"#;

const BOUNDARY: &str = "pixelsmith-test-boundary";
const INDEX_PAGE: &str = "<html><body>pixelsmith</body></html>";

/// Clears every pure white pixel.
struct WhiteBackgroundRemover;

impl BackgroundRemover for WhiteBackgroundRemover {
    fn remove_background(&self, img: &DynamicImage) -> anyhow::Result<RgbaImage> {
        let rgb = img.to_rgb8();
        let mask = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
            if rgb.get_pixel(x, y) == &Rgb([255, 255, 255]) {
                Luma([0])
            } else {
                Luma([255])
            }
        });

        Ok(apply_mask(img, &mask))
    }
}

/// Holds every job for `delay` while tracking how many run at once.
#[derive(Default)]
struct SlowRemover {
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowRemover {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

impl BackgroundRemover for SlowRemover {
    fn remove_background(&self, img: &DynamicImage) -> anyhow::Result<RgbaImage> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        std::thread::sleep(self.delay);

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(img.to_rgba8())
    }
}

struct TestEnvironment<E> {
    client: TestClient<E>,
    temp_dir: TempDir,
    _static_dir: TempDir,
}

async fn setup_environment(
    remover: Arc<dyn BackgroundRemover>,
) -> anyhow::Result<TestEnvironment<impl Endpoint>> {
    config::init_test(TEST_CONFIG)?;

    let cfg = config::config();
    let global_limiter = cfg.max_concurrency.map(Semaphore::new).map(Arc::new);
    let timeout = cfg.processing_timeout.map(Duration::from_secs);

    setup_limited_environment(remover, global_limiter, timeout).await
}

async fn setup_limited_environment(
    remover: Arc<dyn BackgroundRemover>,
    global_limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
) -> anyhow::Result<TestEnvironment<impl Endpoint>> {
    config::init_test(TEST_CONFIG)?;
    let cfg = config::config();

    let temp_dir = tempfile::tempdir()?;
    let static_dir = tempfile::tempdir()?;
    tokio::fs::write(static_dir.path().join("app.html"), INDEX_PAGE).await?;

    let controller = ImageController::new(
        remover,
        temp_dir.path().to_path_buf(),
        global_limiter,
        timeout,
    );

    let app = crate::routes::build_app(
        controller,
        static_dir.path().to_path_buf(),
        &cfg.index_file,
    );

    Ok(TestEnvironment {
        client: TestClient::new(app),
        temp_dir,
        _static_dir: static_dir,
    })
}

/// A red image with a one pixel white border, encoded as a PNG.
fn test_image(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            Rgb([255, 255, 255])
        } else {
            Rgb([200, 30, 30])
        }
    });

    let mut buff = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buff, ImageOutputFormat::Png)
        .expect("encode test image");
    buff.into_inner()
}

fn multipart_body(image: Option<&[u8]>, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();

    if let Some(data) = image {
        body.extend_from_slice(format!(
            "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"upload.png\"\r\nContent-Type: image/png\r\n\r\n",
            BOUNDARY,
        ).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }

    for (name, value) in fields {
        body.extend_from_slice(format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value,
        ).as_bytes());
    }

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn post_form<E: Endpoint>(
    client: &TestClient<E>,
    path: &str,
    image: Option<&[u8]>,
    fields: &[(&str, &str)],
) -> TestResponse {
    client
        .post(path)
        .body(multipart_body(image, fields))
        .content_type(format!("multipart/form-data; boundary={}", BOUNDARY))
        .send()
        .await
}

async fn read_image(res: TestResponse) -> anyhow::Result<DynamicImage> {
    let data = res.0.into_body().into_vec().await?;
    Ok(image::load_from_memory(&data)?)
}

async fn read_error_kind(res: TestResponse) -> String {
    let body = res.json().await;
    body.value().object().get("kind").string().to_string()
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// Polls until `check` holds, giving up after five seconds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    check()
}

#[tokio::test]
async fn test_optimize_without_image_is_rejected() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    let res = post_form(&env.client, "/optimize", None, &[("format", "png")]).await;
    res.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(read_error_kind(res).await, "missing_input");

    Ok(())
}

#[tokio::test]
async fn test_remove_bg_without_image_is_rejected() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    let res = post_form(&env.client, "/remove-bg", None, &[]).await;
    res.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(read_error_kind(res).await, "missing_input");

    Ok(())
}

#[tokio::test]
async fn test_optimize_defaults_to_webp() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(200, 100);

    let res = post_form(&env.client, "/optimize", Some(&image), &[]).await;
    res.assert_status_is_ok();
    res.assert_content_type("image/webp");

    let data = res.0.into_body().into_vec().await?;
    assert_eq!(image::guess_format(&data)?, image::ImageFormat::WebP);

    Ok(())
}

#[tokio::test]
async fn test_optimize_resizes_inside_bounds() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(200, 100);

    let res = post_form(
        &env.client,
        "/optimize",
        Some(&image),
        &[("format", "png"), ("width", "100")],
    ).await;
    res.assert_status_is_ok();
    res.assert_content_type("image/png");

    let out = read_image(res).await?;
    assert_eq!((out.width(), out.height()), (100, 50));

    Ok(())
}

#[tokio::test]
async fn test_optimize_never_enlarges() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(40, 20);

    let res = post_form(
        &env.client,
        "/optimize",
        Some(&image),
        &[("format", "png"), ("width", "400"), ("height", "400")],
    ).await;
    res.assert_status_is_ok();

    let out = read_image(res).await?;
    assert_eq!((out.width(), out.height()), (40, 20));

    Ok(())
}

#[tokio::test]
async fn test_optimize_jpeg_with_transforms() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(200, 100);

    let res = post_form(
        &env.client,
        "/optimize",
        Some(&image),
        &[
            ("format", "jpeg"),
            ("quality", "60"),
            ("rotate", "90"),
            ("grayscale", "true"),
            ("flip", "true"),
            ("flop", "false"),
        ],
    ).await;
    res.assert_status_is_ok();
    res.assert_content_type("image/jpeg");

    let out = read_image(res).await?;
    assert_eq!((out.width(), out.height()), (100, 200));

    Ok(())
}

#[tokio::test]
async fn test_optimize_width_bounds_rotated_output() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(200, 400);

    let res = post_form(
        &env.client,
        "/optimize",
        Some(&image),
        &[("format", "png"), ("width", "100"), ("fit", "inside"), ("rotate", "90")],
    ).await;
    res.assert_status_is_ok();

    let out = read_image(res).await?;
    assert_eq!((out.width(), out.height()), (100, 50));

    Ok(())
}

#[tokio::test]
async fn test_optimize_unknown_format_is_rejected() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(20, 20);

    let res = post_form(&env.client, "/optimize", Some(&image), &[("format", "bmp")]).await;
    res.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(read_error_kind(res).await, "unsupported_format");

    Ok(())
}

#[tokio::test]
async fn test_optimize_invalid_directive_is_rejected() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(20, 20);

    let res = post_form(&env.client, "/optimize", Some(&image), &[("width", "wide")]).await;
    res.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(read_error_kind(res).await, "invalid_directive");

    Ok(())
}

#[tokio::test]
async fn test_optimize_garbage_upload_fails() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    let res = post_form(&env.client, "/optimize", Some(&b"not an image at all"[..]), &[]).await;
    res.assert_status(StatusCode::INTERNAL_SERVER_ERROR);

    let body = res.json().await;
    let body = body.value().object();
    body.get("kind").assert_string("processing_error");
    body.get("message").assert_string("Error processing image.");

    Ok(())
}

#[tokio::test]
async fn test_optimize_empty_image_fails() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    // A valid PNM header describing a 0x5 image.
    let res = post_form(
        &env.client,
        "/optimize",
        Some(&b"P5\n0 5\n255\n"[..]),
        &[("width", "10")],
    ).await;
    res.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_error_kind(res).await, "processing_error");

    // The server is still able to handle requests afterwards.
    let image = test_image(20, 20);
    let res = post_form(&env.client, "/optimize", Some(&image), &[("format", "png")]).await;
    res.assert_status_is_ok();

    Ok(())
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = vec![0u8; 2 * 1024 * 1024];

    let res = post_form(&env.client, "/optimize", Some(&image), &[]).await;
    res.assert_status(StatusCode::PAYLOAD_TOO_LARGE);

    Ok(())
}

#[tokio::test]
async fn test_remove_bg_returns_transparent_png() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;
    let image = test_image(30, 30);

    let res = post_form(&env.client, "/remove-bg", Some(&image), &[]).await;
    res.assert_status_is_ok();
    res.assert_content_type("image/png");

    let out = read_image(res).await?.to_rgba8();
    assert_eq!((out.width(), out.height()), (30, 30));
    assert_eq!(out.get_pixel(0, 0)[3], 0);
    assert_eq!(out.get_pixel(15, 15)[3], 255);

    assert_eq!(staged_files(env.temp_dir.path()), 0);

    Ok(())
}

#[tokio::test]
async fn test_remove_bg_garbage_upload_fails() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    let res = post_form(&env.client, "/remove-bg", Some(&b"garbage"[..]), &[]).await;
    res.assert_status(StatusCode::INTERNAL_SERVER_ERROR);

    let body = res.json().await;
    body.value().object().get("message").assert_string("Error removing background.");

    assert_eq!(staged_files(env.temp_dir.path()), 0);

    Ok(())
}

#[tokio::test]
async fn test_remove_bg_without_model_fails() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(DisabledRemover)).await?;
    let image = test_image(30, 30);

    let res = post_form(&env.client, "/remove-bg", Some(&image), &[]).await;
    res.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(staged_files(env.temp_dir.path()), 0);

    Ok(())
}

#[tokio::test]
async fn test_index_page_is_served() -> anyhow::Result<()> {
    let env = setup_environment(Arc::new(WhiteBackgroundRemover)).await?;

    let res = env.client.get("/").send().await;
    res.assert_status_is_ok();
    res.assert_text(INDEX_PAGE).await;

    Ok(())
}

#[tokio::test]
async fn test_remove_bg_times_out() -> anyhow::Result<()> {
    let limiter = Arc::new(Semaphore::new(1));
    let env = setup_limited_environment(
        Arc::new(SlowRemover::new(Duration::from_millis(750))),
        Some(limiter.clone()),
        Some(Duration::from_millis(50)),
    ).await?;
    let image = test_image(30, 30);

    let res = post_form(&env.client, "/remove-bg", Some(&image), &[]).await;
    res.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_error_kind(res).await, "timeout");

    // The job keeps its permit and its staged input until it really ends.
    assert_eq!(limiter.available_permits(), 0);

    let temp_dir = env.temp_dir.path().to_path_buf();
    assert!(eventually(|| limiter.available_permits() == 1).await);
    assert!(eventually(|| staged_files(&temp_dir) == 0).await);

    Ok(())
}

#[tokio::test]
async fn test_concurrency_is_limited() -> anyhow::Result<()> {
    let remover = Arc::new(SlowRemover::new(Duration::from_millis(100)));
    let env = setup_limited_environment(
        remover.clone(),
        Some(Arc::new(Semaphore::new(1))),
        None,
    ).await?;
    let image = test_image(30, 30);

    let (a, b, c) = tokio::join!(
        post_form(&env.client, "/remove-bg", Some(&image), &[]),
        post_form(&env.client, "/remove-bg", Some(&image), &[]),
        post_form(&env.client, "/remove-bg", Some(&image), &[]),
    );

    a.assert_status_is_ok();
    b.assert_status_is_ok();
    c.assert_status_is_ok();
    assert_eq!(remover.peak.load(Ordering::SeqCst), 1);

    Ok(())
}
