//! `data:` URL encoding for binary image payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::CoreError;

/// Encode `bytes` as `data:{mime};base64,...`.
pub fn encode(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// MIME type declared by a `data:` URL, if `url` is one.
pub fn mime_of(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("data:")?;
    let header = rest.split_once(',')?.0;
    let mime = header.split(';').next()?.trim();
    (!mime.is_empty()).then_some(mime)
}

/// Decode a base64 `data:` URL into its MIME type and payload.
pub fn decode(url: &str) -> Result<(String, Vec<u8>), CoreError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| CoreError::Validation("not a data URL".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| CoreError::Validation("data URL has no payload".into()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| CoreError::Validation("data URL is not base64-encoded".into()))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CoreError::Validation(format!("invalid base64 payload: {e}")))?;
    Ok((mime.to_string(), bytes))
}
