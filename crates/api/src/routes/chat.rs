use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;

use crate::config::ServerConfig;
use crate::handlers::{chat, upload};
use crate::state::AppState;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Chat and upload routes.
///
/// The upload route lifts axum's default body limit because the upload
/// guard enforces `MAX_VIDEO_SIZE_MB` while streaming. The chat route caps
/// its JSON body at `CHAT_BODY_LIMIT_MB`, which must fit inline frames.
pub fn router(config: &ServerConfig) -> Router<AppState> {
    Router::new()
        .route(
            "/chat/video/upload",
            post(upload::upload_video).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/chat/stream",
            post(chat::chat_stream)
                .layer(DefaultBodyLimit::max(config.chat_body_limit_mb * BYTES_PER_MB)),
        )
}
