//! Client for OpenAI-compatible chat-completion endpoints.
//!
//! Provides bearer-credential strategies, the streaming completions API
//! wrapper, server-sent-event decoding, and the NDJSON relay that turns an
//! upstream stream into client-facing lines.

pub mod api;
pub mod credential;
pub mod relay;
pub mod sse;

pub use api::{ChatCompletionChunk, ChatCompletionRequest, CompletionClient, UpstreamError};
pub use credential::{Credential, CredentialError};
