/// Domain errors raised by the ingestion and assembly pipelines.
///
/// The API layer maps each variant to an HTTP status; see
/// `chatvision_api::error::AppError`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid file type: {0}")]
    InvalidFormat(String),

    #[error("File too large. Max size: {limit_mb} MB")]
    PayloadTooLarge { limit_mb: u64 },

    #[error("Cannot open video file: {0}")]
    UnreadableVideo(String),

    #[error("No frames could be extracted from video")]
    NoFramesExtracted,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}
