//! Streaming client for an OpenAI-compatible chat-completions endpoint.
//!
//! Wraps `POST {base}/chat/completions` with `stream: true` using
//! [`reqwest`] and decodes the server-sent-event body into
//! [`ChatCompletionChunk`]s.

use std::time::Duration;

use chatvision_core::chat::ChatMessage;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::credential::{Credential, CredentialError};
use crate::sse;

/// Upper bound on establishing the upstream connection. The body itself
/// may stream for longer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded upstream events, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk, UpstreamError>>;

/// Errors talking to the completion endpoint.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint returned a non-2xx status code.
    #[error("Completion API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Could not obtain credential: {0}")]
    Credential(#[from] CredentialError),

    /// The event stream was malformed or carried an in-band error.
    #[error("{0}")]
    Stream(String),
}

/// Request body for a streaming completion.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub stream: bool,
}

/// One streamed completion event.
///
/// Choices are kept as raw JSON so they are relayed exactly as the
/// endpoint produced them.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
}

/// HTTP client for one completion deployment.
pub struct CompletionClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    credential: Credential,
}

impl CompletionClient {
    /// * `base_url` - API root, e.g. `https://models.github.ai/inference`.
    /// * `model` - Model or deployment id sent in every request.
    pub fn new(base_url: String, model: String, credential: Credential) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url, model, credential))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        base_url: String,
        model: String,
        credential: Credential,
    ) -> Self {
        Self {
            client,
            base_url,
            model,
            credential,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Open a streaming completion for `messages`.
    ///
    /// Resolves once the endpoint has accepted the request; the returned
    /// stream then yields events as they arrive and ends after `[DONE]`
    /// or when the connection closes.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<ChunkStream, UpstreamError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            stream: true,
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(token) = self.credential.bearer_token(&self.client).await? {
            request = request.bearer_auth(token);
        }

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            temperature,
            "Opening completion stream",
        );

        let response = Self::ensure_success(request.send().await?).await?;
        Ok(sse::decode_chunks(response.bytes_stream()).boxed())
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(UpstreamError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
