#![allow(dead_code)]

use std::process::Command;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use chatvision_api::config::ServerConfig;
use chatvision_api::provider::UpstreamProvider;
use chatvision_api::router::build_app_router;
use chatvision_api::state::AppState;

/// Multipart boundary used by [`multipart_body`].
pub const BOUNDARY: &str = "chatvision-test-boundary";

/// Build a test `ServerConfig` with safe defaults, sending completions to
/// `upstream` (an OpenAI-compatible base URL).
pub fn test_config(upstream: &str) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:50505".to_string()],
        request_timeout_secs: 30,
        max_video_size_mb: 4,
        allowed_video_extensions: vec![".mp4".to_string()],
        allowed_image_extensions: vec![".png".to_string(), ".jpg".to_string(), ".jpeg".to_string()],
        chat_body_limit_mb: 1,
        video_extract_fps: 1.0,
        max_concurrent_extractions: 2,
        max_frames_per_request: 10,
        openai_model: "gpt-4o".to_string(),
        provider: UpstreamProvider::Local {
            endpoint: upstream.to_string(),
        },
        system_prompt: None,
        storage: None,
    }
}

/// Build the full application router from `config`, exactly as `main.rs`
/// does but without a durable store.
pub fn build_test_app(config: ServerConfig) -> Router {
    let completions = config
        .provider
        .build_client(&config.openai_model)
        .expect("completion client");
    let state = AppState::new(config.clone(), completions, None);
    build_app_router(state, &config)
}

/// Router whose upstream is unreachable; fine for tests that never stream.
pub fn default_test_app() -> Router {
    build_test_app(test_config("http://127.0.0.1:9"))
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// POST a single-file multipart form.
pub async fn post_multipart(
    app: Router,
    uri: &str,
    field: &str,
    filename: &str,
    data: &[u8],
) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(field, filename, data)))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Whether `ffmpeg` and `ffprobe` are on `PATH`.
pub fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        Command::new(bin)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

/// Render a `seconds`-long 30 fps test pattern to an MP4 and return its bytes.
pub fn synthetic_video(seconds: u32) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("synthetic.mp4");
    let status = Command::new("ffmpeg")
        .args(["-v", "error", "-f", "lavfi", "-i"])
        .arg(format!("testsrc=duration={seconds}:size=64x48:rate=30"))
        .args(["-c:v", "mpeg4", "-y"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success(), "ffmpeg failed to render test video");
    std::fs::read(&path).unwrap()
}
