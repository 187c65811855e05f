//! Handler for `POST /chat/video/upload`.

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use chatvision_core::upload::{content_type_for_extension, StagedUpload};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Multipart field carrying the video.
const VIDEO_FIELD: &str = "video";

/// Successful upload: the sampled frames plus where the original was stored.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub frames: Vec<String>,
    #[serde(rename = "frameCount")]
    pub frame_count: usize,
    /// `null` when the durable store is not configured.
    #[serde(rename = "blobURL")]
    pub blob_url: Option<String>,
    pub filename: String,
}

/// POST /chat/video/upload
///
/// Streams the `video` field to a temporary file under the upload size
/// limit, then extracts frames and copies the original to the durable
/// store concurrently. The temporary file is removed before responding.
pub async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<UploadResponse>> {
    let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let staged = stage_video_field(&state, &mut multipart).await?;

    let content_type = content_type_for_extension(&staged.extension);
    let (frames, blob_url) = tokio::join!(
        state.sampler.extract(staged.path()),
        store_original(&state, &staged, content_type),
    );

    let filename = staged.filename.clone();
    staged.cleanup();

    let frames = frames?;
    let blob_url = blob_url?;

    tracing::info!(
        filename = %filename,
        frames = frames.len(),
        stored = blob_url.is_some(),
        "Processed video upload",
    );

    Ok(Json(UploadResponse {
        success: true,
        frame_count: frames.len(),
        frames,
        blob_url,
        filename,
    }))
}

/// Find the `video` field and stream it through the upload guard.
async fn stage_video_field(state: &AppState, multipart: &mut Multipart) -> AppResult<StagedUpload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        let raw_filename = field.file_name().unwrap_or_default().to_string();
        if raw_filename.trim().is_empty() {
            return Err(AppError::BadRequest("No video file selected".into()));
        }

        let reader = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
        return Ok(state.upload_policy.accept(&raw_filename, reader).await?);
    }

    Err(AppError::BadRequest("No video file provided".into()))
}

/// Copy the staged file to the durable store, if one is configured.
async fn store_original(
    state: &AppState,
    staged: &StagedUpload,
    content_type: &str,
) -> AppResult<Option<String>> {
    let Some(store) = &state.store else {
        return Ok(None);
    };
    let url = store
        .upload_file(staged.path(), &staged.filename, content_type)
        .await?;
    Ok(Some(url))
}
