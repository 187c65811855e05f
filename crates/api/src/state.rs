use std::sync::Arc;

use chatvision_cloud::VideoStore;
use chatvision_core::chat::ChatAssembler;
use chatvision_core::frames::FrameSampler;
use chatvision_core::upload::UploadPolicy;
use chatvision_llm::CompletionClient;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Size and extension limits for video uploads.
    pub upload_policy: Arc<UploadPolicy>,
    /// Frame extractor with its own concurrency limit.
    pub sampler: FrameSampler,
    /// Builds upstream message lists for chat turns.
    pub assembler: Arc<ChatAssembler>,
    /// Client for the upstream completion endpoint.
    pub completions: Arc<CompletionClient>,
    /// Durable store for original uploads; `None` when not configured.
    pub store: Option<Arc<VideoStore>>,
}

impl AppState {
    /// Build the per-process components described by `config`.
    pub fn new(
        config: ServerConfig,
        completions: CompletionClient,
        store: Option<Arc<VideoStore>>,
    ) -> Self {
        let upload_policy = UploadPolicy::new(
            config.max_video_size_mb,
            config.allowed_video_extensions.iter().cloned(),
        );
        let sampler = FrameSampler::new(config.video_extract_fps, config.max_concurrent_extractions);

        let mut assembler = ChatAssembler::new(config.max_frames_per_request);
        if let Some(prompt) = &config.system_prompt {
            assembler = assembler.with_system_prompt(prompt.clone());
        }

        Self {
            config: Arc::new(config),
            upload_policy: Arc::new(upload_policy),
            sampler,
            assembler: Arc::new(assembler),
            completions: Arc::new(completions),
            store,
        }
    }
}
