//! Tests for `AppError` -> HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no HTTP server
//! is involved.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use chatvision_api::error::AppError;
use chatvision_cloud::StorageError;
use chatvision_core::error::CoreError;
use http_body_util::BodyExt;

/// Helper: convert an `AppError` into its status code and parsed JSON body.
async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

// ---------------------------------------------------------------------------
// Test: CoreError::InvalidFormat maps to 400 with INVALID_FORMAT code
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_format_returns_400() {
    let err = AppError::Core(CoreError::InvalidFormat("Only .mp4 allowed".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_FORMAT");
    assert_eq!(json["error"], "Invalid file type: Only .mp4 allowed");
}

// ---------------------------------------------------------------------------
// Test: CoreError::PayloadTooLarge maps to 413 and names the limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_too_large_returns_413() {
    let err = AppError::Core(CoreError::PayloadTooLarge { limit_mb: 2048 });

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(json["error"], "File too large. Max size: 2048 MB");
}

// ---------------------------------------------------------------------------
// Test: unreadable and frameless videos map to 422
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreadable_video_returns_422() {
    let err = AppError::Core(CoreError::UnreadableVideo("moov atom not found".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "UNREADABLE_VIDEO");
}

#[tokio::test]
async fn no_frames_extracted_returns_422() {
    let (status, json) = error_to_response(AppError::Core(CoreError::NoFramesExtracted)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "NO_FRAMES_EXTRACTED");
    assert_eq!(json["error"], "No frames could be extracted from video");
}

// ---------------------------------------------------------------------------
// Test: storage failures map to 500 without leaking details
// ---------------------------------------------------------------------------

#[tokio::test]
async fn storage_unavailable_returns_500() {
    let err = AppError::Storage(StorageError::Unavailable(
        "upload of secret-key failed".into(),
    ));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "STORAGE_UNAVAILABLE");
    assert!(!json["error"].as_str().unwrap().contains("secret-key"));
}

// ---------------------------------------------------------------------------
// Test: internal errors are sanitized
// ---------------------------------------------------------------------------

#[tokio::test]
async fn internal_errors_return_500_with_generic_message() {
    for err in [
        AppError::Core(CoreError::Internal("ffprobe missing".into())),
        AppError::InternalError("join error".into()),
    ] {
        let (status, json) = error_to_response(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "INTERNAL_ERROR");
        assert_eq!(json["error"], "An internal error occurred");
    }
}

// ---------------------------------------------------------------------------
// Test: AppError::BadRequest and validation map to 400
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bad_request_error_returns_400() {
    let (status, json) =
        error_to_response(AppError::BadRequest("No video file provided".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "No video file provided");

    let (status, json) =
        error_to_response(AppError::Core(CoreError::Validation("messages must not be empty".into())))
            .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
}
