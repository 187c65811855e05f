//! Handler for `POST /chat/stream`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chatvision_core::chat::{validate_image_reference, ChatContext, ChatMessage};
use chatvision_core::error::CoreError;
use chatvision_llm::relay::relay;
use futures::StreamExt;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const DEFAULT_TEMPERATURE: f32 = 0.5;

/// Sampling temperatures accepted by OpenAI-compatible endpoints.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// Body of a chat turn: the full history, the last element being the
/// pending user message, plus any media attached to it.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub context: Option<ChatContext>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

/// POST /chat/stream
///
/// Responds with `application/x-ndjson`: one line per upstream choice,
/// or a final `{"error": ...}` line if the upstream fails. Request
/// validation errors are returned as ordinary JSON error responses before
/// streaming starts.
pub async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload.map_err(|rejection| reject_body(rejection, &state))?;

    if !TEMPERATURE_RANGE.contains(&request.temperature) {
        return Err(AppError::Core(CoreError::Validation(format!(
            "temperature must be between {} and {}",
            TEMPERATURE_RANGE.start(),
            TEMPERATURE_RANGE.end()
        ))));
    }

    let context = request.context.unwrap_or_default();
    if context.frames.is_empty() {
        if let Some(image) = &context.file {
            validate_image_reference(image, &state.config.allowed_image_extensions)?;
        }
    }

    let messages = state.assembler.assemble(request.messages, &context)?;
    tracing::info!(
        messages = messages.len(),
        frames = context.frames.len(),
        image = context.file.is_some(),
        "Relaying chat turn",
    );

    let completions = Arc::clone(&state.completions);
    let temperature = request.temperature;
    let lines = relay(async move { completions.stream_chat(&messages, temperature).await });

    Response::builder()
        .header(CONTENT_TYPE, "application/x-ndjson")
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(lines.map(Ok::<_, Infallible>)))
        .map_err(|e| AppError::InternalError(format!("Failed to build stream response: {e}")))
}

fn reject_body(rejection: JsonRejection, state: &AppState) -> AppError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::Core(CoreError::PayloadTooLarge {
            limit_mb: state.config.chat_body_limit_mb as u64,
        });
    }
    AppError::BadRequest(rejection.body_text())
}
