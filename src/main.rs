//! countcam - webcam object-detection streamer
//!
//! Captures frames from a V4L2 webcam, runs each one through an external
//! pre-trained detection/tracking model, draws boxes and a running count
//! overlay, and serves the result as an MJPEG stream alongside JSON count
//! statistics and a single-image detect endpoint.

mod annotate;
mod capture;
mod config;
mod counts;
mod detector;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use clap::Parser;
use futures::StreamExt;
use image::{ImageFormat, RgbImage};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use capture::FrameCapture;
use config::AppConfig;
use counts::CountRegistry;
use detector::DetectorHandle;

const MULTIPART_BOUNDARY: &str = "frame";
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state
struct AppState {
    current_frame: RwLock<Option<Bytes>>,
    frame_count: RwLock<u64>,
    counts: CountRegistry,
    detector: Option<DetectorHandle>,
    config: AppConfig,
    started: Instant,
}

impl AppState {
    fn new(config: AppConfig, detector: Option<DetectorHandle>) -> Self {
        Self {
            current_frame: RwLock::new(None),
            frame_count: RwLock::new(0),
            counts: CountRegistry::new(),
            detector,
            config,
            started: Instant::now(),
        }
    }
}

type SharedState = Arc<AppState>;

#[derive(Parser, Debug)]
#[command(name = "countcam", about = "Webcam object-detection streamer")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "countcam.toml")]
    config: PathBuf,
    /// Override the listen address from the config file
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Override the camera device from the config file
    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(device) = args.device {
        config.camera.device = device;
    }

    info!("countcam starting...");

    let detector = match DetectorHandle::spawn(config.detector.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("running without a detector: {e:#}");
            None
        }
    };

    let capture = FrameCapture::with_config(config.camera.clone())?;
    capture.configure_device()?;

    let bind = config.server.bind;
    let state = Arc::new(AppState::new(config, detector));

    let pipeline_state = state.clone();
    tokio::spawn(async move {
        pipeline_loop(pipeline_state, capture).await;
    });

    let app = router(state);

    info!("starting web server on http://{bind}");
    info!("  - live view:    http://{bind}/");
    info!("  - MJPEG stream: http://{bind}/stream");
    info!("  - single frame: http://{bind}/frame.jpg");
    info!("  - counts JSON:  http://{bind}/counts");
    info!("  - upload:       POST http://{bind}/detect");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/stream", get(mjpeg_stream_handler))
        .route("/frame.jpg", get(frame_handler))
        .route("/counts", get(counts_handler))
        .route("/counts/reset", post(reset_counts_handler))
        .route("/detect", post(detect_handler))
        .route("/status", get(status_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Capture -> infer -> count -> annotate -> encode -> publish, forever.
/// Transient capture errors are tolerated up to a bound, then the pipeline
/// stops and the server keeps serving the last frame and the statistics.
async fn pipeline_loop(state: SharedState, capture: FrameCapture) {
    let mut ticker = interval(stream_period(state.config.server.stream_fps));
    let mut consecutive_failures = 0u32;

    loop {
        ticker.tick().await;

        let frame = match capture.capture_rgb_frame() {
            Ok(frame) => {
                consecutive_failures = 0;
                frame
            }
            Err(e) => {
                consecutive_failures += 1;
                error!("capture error ({consecutive_failures} in a row): {e:#}");
                if consecutive_failures >= state.config.camera.max_consecutive_failures {
                    error!("camera is not coming back, stopping the pipeline");
                    break;
                }
                continue;
            }
        };

        if let Err(e) = process_frame(&state, frame) {
            warn!("frame skipped: {e:#}");
        }
    }
}

fn process_frame(state: &SharedState, mut frame: RgbImage) -> Result<()> {
    let quality = state.config.camera.jpeg_quality;

    if let Some(detector) = &state.detector {
        let plain = capture::encode_jpeg(&frame, quality)?;
        detector.submit(plain)?;

        // results lag inference by about a frame, which is fine at stream rate
        let mut result = detector.last_result();
        detector::retain_confident(&mut result, state.config.detector.min_confidence);
        state.counts.record(&result.detections);
        annotate::draw_detections(&mut frame, &result.detections);
    } else {
        state.counts.record(&[]);
    }

    annotate::draw_count_banner(&mut frame, &state.counts.snapshot());

    let annotated = capture::encode_jpeg(&frame, quality)?;
    *state.current_frame.write() = Some(Bytes::from(annotated));
    *state.frame_count.write() += 1;
    Ok(())
}

fn stream_period(fps: u32) -> Duration {
    Duration::from_millis((1000 / fps.max(1)).max(1) as u64)
}

/// One part of the multipart/x-mixed-replace stream
fn multipart_part(boundary: &str, jpeg: &Bytes) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        jpeg.len()
    );
    let mut data = Vec::with_capacity(header.len() + jpeg.len() + 2);
    data.extend_from_slice(header.as_bytes());
    data.extend_from_slice(jpeg);
    data.extend_from_slice(b"\r\n");
    Bytes::from(data)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn frame_handler(State(state): State<SharedState>) -> Response {
    match &*state.current_frame.read() {
        Some(frame) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            ],
            frame.clone(),
        )
            .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no frame captured yet"),
    }
}

async fn mjpeg_stream_handler(State(state): State<SharedState>) -> Response {
    let period = stream_period(state.config.server.stream_fps);

    let stream = IntervalStream::new(interval(period)).map(move |_| {
        let frame = state.current_frame.read().clone();
        let bytes = match frame {
            Some(jpeg) => multipart_part(MULTIPART_BOUNDARY, &jpeg),
            None => Bytes::new(),
        };
        Ok::<_, std::convert::Infallible>(bytes)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MULTIPART_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn counts_handler(State(state): State<SharedState>) -> Json<counts::CountSnapshot> {
    Json(state.counts.snapshot())
}

async fn reset_counts_handler(State(state): State<SharedState>) -> Json<counts::CountSnapshot> {
    state.counts.reset();
    info!("count statistics reset");
    Json(state.counts.snapshot())
}

async fn status_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let frame_count = *state.frame_count.read();
    let has_frame = state.current_frame.read().is_some();

    Json(serde_json::json!({
        "frame_count": frame_count,
        "has_frame": has_frame,
        "resolution": format!("{}x{}", state.config.camera.width, state.config.camera.height),
        "uptime_secs": state.started.elapsed().as_secs(),
        "detector_alive": state.detector.as_ref().map(|d| d.is_alive()).unwrap_or(false),
    }))
}

#[derive(Debug, Default, serde::Deserialize)]
struct DetectQuery {
    #[serde(default)]
    annotated: Option<String>,
}

impl DetectQuery {
    fn wants_annotated(&self) -> bool {
        matches!(self.annotated.as_deref(), Some("1") | Some("true") | Some("yes"))
    }
}

/// Run the model on a single uploaded image
async fn detect_handler(
    State(state): State<SharedState>,
    Query(query): Query<DetectQuery>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty request body");
    }
    let image = match image::load_from_memory(&body) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("unreadable image: {e}"))
        }
    };
    if state.detector.is_none() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no detector running");
    }

    let quality = state.config.camera.jpeg_quality;
    let is_jpeg = matches!(image::guess_format(&body), Ok(ImageFormat::Jpeg));
    let jpeg = if is_jpeg {
        body.to_vec()
    } else {
        match capture::encode_jpeg(&image, quality) {
            Ok(jpeg) => jpeg,
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        }
    };

    let timeout = Duration::from_millis(state.config.detector.response_timeout_ms);
    let worker_state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || match worker_state.detector.as_ref() {
        Some(detector) => detector.detect(jpeg, timeout),
        None => anyhow::bail!("no detector running"),
    })
    .await;

    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            let status = match e.downcast_ref::<RecvTimeoutError>() {
                Some(RecvTimeoutError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return error_response(status, format!("{e:#}"));
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("detect task failed: {e}"),
            )
        }
    };

    if let Some(model_error) = &result.error {
        return error_response(StatusCode::BAD_GATEWAY, model_error.clone());
    }
    detector::retain_confident(&mut result, state.config.detector.min_confidence);

    if query.wants_annotated() {
        let mut annotated = image;
        annotate::draw_detections(&mut annotated, &result.detections);
        return match capture::encode_jpeg(&annotated, quality) {
            Ok(jpeg) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "image/jpeg")],
                Bytes::from(jpeg),
            )
                .into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        };
    }

    let width = result.width.unwrap_or(image.width());
    let height = result.height.unwrap_or(image.height());
    Json(serde_json::json!({
        "width": width,
        "height": height,
        "detections": result.detections,
    }))
    .into_response()
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>countcam</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: 'Segoe UI', Roboto, sans-serif;
            background: #101418;
            color: #d8dee4;
            min-height: 100vh;
            display: flex;
            flex-direction: column;
            align-items: center;
            padding: 24px;
        }
        h1 { font-weight: 300; letter-spacing: 3px; margin-bottom: 4px; color: #6fc3df; }
        .subtitle { color: #6a737d; font-size: .85rem; margin-bottom: 18px; }
        .video { background: #000; border: 1px solid #2a3138; border-radius: 8px; overflow: hidden; }
        #stream { display: block; max-width: 100%; max-height: 70vh; }
        table { margin-top: 20px; border-collapse: collapse; min-width: 340px; }
        th, td { padding: 6px 14px; text-align: left; border-bottom: 1px solid #2a3138; }
        th { color: #6a737d; font-weight: 500; font-size: .8rem; text-transform: uppercase; }
        td.num { text-align: right; font-variant-numeric: tabular-nums; }
        .statusline { margin-top: 16px; color: #6a737d; font-size: .85rem; }
        .statusline span { color: #6fc3df; }
        button {
            margin-top: 14px;
            background: #22303c;
            color: #d8dee4;
            border: 1px solid #2a3138;
            border-radius: 6px;
            padding: 8px 18px;
            cursor: pointer;
        }
        button:hover { background: #2d3e4e; }
    </style>
</head>
<body>
    <h1>COUNTCAM</h1>
    <p class="subtitle">live detection &amp; counting</p>

    <div class="video"><img id="stream" src="/stream" alt="live stream"></div>

    <table>
        <thead><tr><th>class</th><th>live</th><th>unique</th></tr></thead>
        <tbody id="counts"></tbody>
    </table>
    <button onclick="resetCounts()">reset counters</button>

    <p class="statusline">
        frames <span id="frames">0</span> &middot;
        fps <span id="fps">--</span> &middot;
        detector <span id="detector">?</span>
    </p>

    <script>
        let lastCount = 0;

        async function refreshCounts() {
            const res = await fetch('/counts');
            const data = await res.json();
            const rows = Object.entries(data.classes).map(([name, c]) =>
                `<tr><td>${name}</td><td class="num">${c.live}</td><td class="num">${c.unique}</td></tr>`);
            document.getElementById('counts').innerHTML =
                rows.join('') || '<tr><td colspan="3">nothing detected yet</td></tr>';
        }

        async function refreshStatus() {
            const res = await fetch('/status');
            const data = await res.json();
            document.getElementById('frames').textContent = data.frame_count;
            document.getElementById('fps').textContent = data.frame_count - lastCount;
            document.getElementById('detector').textContent = data.detector_alive ? 'up' : 'down';
            lastCount = data.frame_count;
        }

        async function resetCounts() {
            await fetch('/counts/reset', { method: 'POST' });
            refreshCounts();
        }

        setInterval(() => {
            refreshCounts().catch(() => {});
            refreshStatus().catch(() => {});
        }, 1000);
        refreshCounts().catch(() => {});
        refreshStatus().catch(() => {});
    </script>
</body>
</html>"##;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        Arc::new(AppState::new(AppConfig::default(), None))
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn multipart_part_framing() {
        let jpeg = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let part = multipart_part("frame", &jpeg);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
    }

    #[test]
    fn stream_period_is_sane() {
        assert_eq!(stream_period(30), Duration::from_millis(33));
        assert_eq!(stream_period(1), Duration::from_millis(1000));
        // clamped, never zero
        assert_eq!(stream_period(0), Duration::from_millis(1000));
        assert_eq!(stream_period(5000), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn index_serves_the_live_view() {
        let response = router(test_state())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8_lossy(&bytes);
        assert!(html.contains("/stream"));
        assert!(html.contains("/counts"));
    }

    #[tokio::test]
    async fn counts_starts_empty() {
        let response = router(test_state())
            .oneshot(Request::builder().uri("/counts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["frames"], 0);
        assert_eq!(json["total_unique"], 0);
        assert!(json["classes"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_reflect_recorded_frames() {
        let state = test_state();
        state.counts.record(&[detector::Detection {
            class: "person".to_string(),
            confidence: 0.9,
            track_id: Some(11),
            bbox: detector::BBox {
                x1: 0,
                y1: 0,
                x2: 5,
                y2: 5,
            },
        }]);

        let response = router(state)
            .oneshot(Request::builder().uri("/counts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["frames"], 1);
        assert_eq!(json["classes"]["person"]["live"], 1);
        assert_eq!(json["classes"]["person"]["unique"], 1);
    }

    #[tokio::test]
    async fn counts_reset_clears_statistics() {
        let state = test_state();
        state.counts.record(&[detector::Detection {
            class: "cat".to_string(),
            confidence: 0.8,
            track_id: Some(1),
            bbox: detector::BBox {
                x1: 0,
                y1: 0,
                x2: 5,
                y2: 5,
            },
        }]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/counts/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["frames"], 0);
        assert!(json["classes"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn frame_is_unavailable_before_first_capture() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/frame.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn frame_is_served_once_published() {
        let state = test_state();
        *state.current_frame.write() = Some(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/frame.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE.as_str()],
            "image/jpeg"
        );
    }

    #[tokio::test]
    async fn stream_advertises_multipart_replace() {
        let response = router(test_state())
            .oneshot(Request::builder().uri("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE.as_str()],
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[tokio::test]
    async fn status_reports_pipeline_state() {
        let response = router(test_state())
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["frame_count"], 0);
        assert_eq!(json["has_frame"], false);
        assert_eq!(json["resolution"], "640x480");
        assert_eq!(json["detector_alive"], false);
    }

    #[tokio::test]
    async fn detect_rejects_garbage_bodies() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/detect")
                    .body(Body::from("not an image at all"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detect_rejects_empty_bodies() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/detect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detect_without_detector_is_unavailable() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/detect")
                    .body(Body::from(png_bytes()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "no detector running");
    }
}
