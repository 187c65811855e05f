use std::fmt::Display;
use std::str::FromStr;

use chatvision_cloud::StorageConfig;
use chatvision_core::chat::DEFAULT_MAX_FRAMES_PER_REQUEST;
use chatvision_core::frames::DEFAULT_TARGET_FPS;
use chatvision_core::upload::normalize_extension;

use crate::provider::UpstreamProvider;

/// Errors raised while loading [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development except the
/// upstream credentials, which depend on `OPENAI_HOST`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `50505`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `300`).
    pub request_timeout_secs: u64,
    /// Upload ceiling in megabytes (default: `2048`).
    pub max_video_size_mb: u64,
    /// Accepted video extensions, lowercase with leading dot.
    pub allowed_video_extensions: Vec<String>,
    /// Accepted image types for chat attachments, lowercase with leading dot.
    pub allowed_image_extensions: Vec<String>,
    /// JSON body limit for `/chat/stream` in megabytes (default: `100`).
    pub chat_body_limit_mb: usize,
    /// Frame extraction rate (default: `1.0`).
    pub video_extract_fps: f64,
    /// Videos decoded in parallel (default: `2`).
    pub max_concurrent_extractions: usize,
    /// Frames attached to one upstream request (default: `10`).
    pub max_frames_per_request: usize,
    /// Model id before provider-specific prefixing (default: `gpt-4o`).
    pub openai_model: String,
    pub provider: UpstreamProvider,
    /// Optional system turn prepended to every chat request.
    pub system_prompt: Option<String>,
    /// Durable store settings; `None` disables blob upload.
    pub storage: Option<StorageConfig>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                  |
    /// |------------------------------|--------------------------|
    /// | `HOST`                       | `0.0.0.0`                |
    /// | `PORT`                       | `50505`                  |
    /// | `CORS_ORIGINS`               | `http://localhost:50505` |
    /// | `REQUEST_TIMEOUT_SECS`       | `300`                    |
    /// | `MAX_VIDEO_SIZE_MB`          | `2048`                   |
    /// | `ALLOWED_VIDEO_EXTENSIONS`   | `.mp4`                   |
    /// | `ALLOWED_IMAGE_EXTENSIONS`   | `.png,.jpg,.jpeg`        |
    /// | `CHAT_BODY_LIMIT_MB`         | `100`                    |
    /// | `VIDEO_EXTRACT_FPS`          | `1.0`                    |
    /// | `MAX_CONCURRENT_EXTRACTIONS` | `2`                      |
    /// | `MAX_FRAMES_PER_REQUEST`     | `10`                     |
    /// | `OPENAI_MODEL`               | `gpt-4o`                 |
    /// | `OPENAI_HOST`                | `github`                 |
    /// | `SYSTEM_PROMPT`              | unset                    |
    /// | `STORAGE_ACCOUNT_URL`        | unset (store disabled)   |
    /// | `STORAGE_CONTAINER_NAME`     | `videos`                 |
    /// | `STORAGE_REGION`             | `us-east-1`              |
    ///
    /// Provider credentials are described on [`UpstreamProvider`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_var(&lookup, "PORT", 50505)?;

        let cors_origins = list_var(&lookup, "CORS_ORIGINS", "http://localhost:50505");
        let request_timeout_secs: u64 = parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 300)?;

        let max_video_size_mb: u64 = parse_var(&lookup, "MAX_VIDEO_SIZE_MB", 2048)?;
        if max_video_size_mb == 0 {
            return Err(invalid("MAX_VIDEO_SIZE_MB", "0", "must be positive"));
        }

        let allowed_video_extensions = extension_list(&lookup, "ALLOWED_VIDEO_EXTENSIONS", ".mp4")?;
        let allowed_image_extensions =
            extension_list(&lookup, "ALLOWED_IMAGE_EXTENSIONS", ".png,.jpg,.jpeg")?;

        let chat_body_limit_mb: usize = parse_var(&lookup, "CHAT_BODY_LIMIT_MB", 100)?;

        let video_extract_fps: f64 = parse_var(&lookup, "VIDEO_EXTRACT_FPS", DEFAULT_TARGET_FPS)?;
        if !video_extract_fps.is_finite() || video_extract_fps <= 0.0 {
            return Err(invalid(
                "VIDEO_EXTRACT_FPS",
                &video_extract_fps.to_string(),
                "must be a positive number",
            ));
        }

        let max_concurrent_extractions: usize = parse_var(&lookup, "MAX_CONCURRENT_EXTRACTIONS", 2)?;
        if max_concurrent_extractions == 0 {
            return Err(invalid("MAX_CONCURRENT_EXTRACTIONS", "0", "must be positive"));
        }

        let max_frames_per_request: usize = parse_var(
            &lookup,
            "MAX_FRAMES_PER_REQUEST",
            DEFAULT_MAX_FRAMES_PER_REQUEST,
        )?;
        if max_frames_per_request == 0 {
            return Err(invalid("MAX_FRAMES_PER_REQUEST", "0", "must be positive"));
        }

        let openai_model = lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".into());
        let provider = UpstreamProvider::from_lookup(&lookup)?;

        let system_prompt = lookup("SYSTEM_PROMPT").filter(|p| !p.trim().is_empty());

        let storage = lookup("STORAGE_ACCOUNT_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|account_url| StorageConfig {
                account_url,
                container: lookup("STORAGE_CONTAINER_NAME").unwrap_or_else(|| "videos".into()),
                region: lookup("STORAGE_REGION").unwrap_or_else(|| "us-east-1".into()),
            });

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            max_video_size_mb,
            allowed_video_extensions,
            allowed_image_extensions,
            chat_body_limit_mb,
            video_extract_fps,
            max_concurrent_extractions,
            max_frames_per_request,
            openai_model,
            provider,
            system_prompt,
            storage,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

fn list_var<F>(lookup: &F, var: &str, default: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .unwrap_or_else(|| default.into())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn extension_list<F>(lookup: &F, var: &'static str, default: &str) -> Result<Vec<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let extensions: Vec<String> = list_var(lookup, var, default)
        .iter()
        .map(|ext| normalize_extension(ext))
        .collect();
    if extensions.is_empty() {
        return Err(invalid(var, "", "at least one extension is required"));
    }
    Ok(extensions)
}
