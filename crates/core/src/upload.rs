//! Size-bounded ingestion of a single uploaded file.
//!
//! [`UploadPolicy::accept`] validates the declared filename, then copies the
//! upload stream into a uniquely-named temporary file in [`CHUNK_SIZE`]
//! pieces. The running total is checked after every chunk, so an oversized
//! upload is rejected while at most one chunk is held in memory.

use std::path::Path;

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::CoreError;

/// Bytes read from the upload stream per iteration.
pub const CHUNK_SIZE: usize = 8192;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Extension and size rules applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    max_size_mb: u64,
    /// Lower-cased, dot-prefixed extensions (e.g. `.mp4`).
    allowed_extensions: Vec<String>,
}

/// An accepted upload, materialized to a temporary file.
///
/// The file is deleted when this value is dropped. Call
/// [`StagedUpload::cleanup`] to delete it explicitly and log failures.
#[derive(Debug)]
pub struct StagedUpload {
    /// Sanitized filename as declared by the client.
    pub filename: String,
    /// Lower-cased, dot-prefixed extension of `filename`.
    pub extension: String,
    /// Number of bytes received.
    pub size_bytes: u64,
    path: TempPath,
}

impl UploadPolicy {
    pub fn new<I, S>(max_size_mb: u64, allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_size_mb,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| normalize_extension(ext.as_ref()))
                .filter(|ext| ext.len() > 1)
                .collect(),
        }
    }

    pub fn max_size_mb(&self) -> u64 {
        self.max_size_mb
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    /// Sanitize `raw` and check its extension against the allow-list.
    ///
    /// Returns the sanitized filename and its lower-cased extension.
    pub fn validate_filename(&self, raw: &str) -> Result<(String, String), CoreError> {
        let filename = sanitize_filename(raw);
        let extension = extension_of(&filename).unwrap_or_default();

        if extension.is_empty() || !self.allowed_extensions.contains(&extension) {
            return Err(CoreError::InvalidFormat(format!(
                "Only {} allowed",
                self.allowed_extensions.join(", ")
            )));
        }

        Ok((filename, extension))
    }

    /// Validate `raw_filename`, then stream `reader` into a temporary file.
    ///
    /// Fails with [`CoreError::PayloadTooLarge`] as soon as the running
    /// total exceeds the configured ceiling; the partial file is removed.
    pub async fn accept<R>(&self, raw_filename: &str, mut reader: R) -> Result<StagedUpload, CoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (filename, extension) = self.validate_filename(raw_filename)?;

        let temp = tempfile::Builder::new()
            .prefix("chatvision-")
            .suffix(&extension)
            .tempfile()?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let max_bytes = self.max_size_bytes();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            let read = reader
                .read(&mut chunk)
                .await
                .map_err(|e| CoreError::Validation(format!("Failed to read upload: {e}")))?;
            if read == 0 {
                break;
            }
            total += read as u64;
            if total > max_bytes {
                tracing::warn!(
                    filename = %filename,
                    received = total,
                    limit_mb = self.max_size_mb,
                    "Upload exceeded size limit",
                );
                return Err(CoreError::PayloadTooLarge {
                    limit_mb: self.max_size_mb,
                });
            }
            file.write_all(&chunk[..read]).await?;
        }

        file.flush().await?;
        drop(file);

        tracing::info!(
            filename = %filename,
            size_mb = %format!("{:.2}", total as f64 / BYTES_PER_MB as f64),
            "Received upload",
        );

        Ok(StagedUpload {
            filename,
            extension,
            size_bytes: total,
            path,
        })
    }
}

impl StagedUpload {
    /// Location of the temporary file holding the upload.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the temporary file. Failures are logged, never returned.
    pub fn cleanup(self) {
        let shown = self.path.display().to_string();
        if let Err(e) = self.path.close() {
            tracing::warn!(path = %shown, error = %e, "Failed to delete temp file");
        }
    }
}

/// Reduce a client-supplied filename to a safe, flat name.
///
/// Drops any directory components, turns whitespace into `_`, removes
/// characters outside `[A-Za-z0-9._-]`, and trims leading dots and
/// underscores so the result can never address a hidden or parent path.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Lower-cased, dot-prefixed extension of `filename`, if it has one.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// MIME type sent to the durable store for a video extension.
pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        ".mp4" | ".m4v" => "video/mp4",
        ".mov" => "video/quicktime",
        ".webm" => "video/webm",
        ".mkv" => "video/x-matroska",
        ".avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Lowercase `ext` and give it a leading dot: `MP4` -> `.mp4`.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}
