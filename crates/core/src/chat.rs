//! Chat message types and upstream request assembly.
//!
//! Messages use the OpenAI chat-completions wire shape so they can be
//! forwarded without translation: `content` is either a string or a list of
//! `{"type": "text"}` / `{"type": "image_url"}` parts.

use serde::{Deserialize, Serialize};

use crate::data_url;
use crate::error::CoreError;

/// Default cap on frames attached to a single request.
pub const DEFAULT_MAX_FRAMES_PER_REQUEST: usize = 10;

/// Image detail level requested for every attached image.
const IMAGE_DETAIL: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Media attached to the pending user turn.
///
/// `file` is a single image URL; `frames` are the data URLs returned by the
/// upload endpoint. When both are present the frames win.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatContext {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub frames: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn user(content: MessageContent) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }
}

impl MessageContent {
    /// Concatenated text of this content, ignoring image parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ContentPart {
    fn image(url: &str) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.to_string(),
                detail: Some(IMAGE_DETAIL.to_string()),
            },
        }
    }
}

/// Builds the message list sent upstream for one chat turn.
#[derive(Debug, Clone)]
pub struct ChatAssembler {
    max_frames_per_request: usize,
    system_prompt: Option<String>,
}

impl ChatAssembler {
    pub fn new(max_frames_per_request: usize) -> Self {
        Self {
            max_frames_per_request,
            system_prompt: None,
        }
    }

    /// Prepend a system turn to every assembled request.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_frames_per_request(&self) -> usize {
        self.max_frames_per_request
    }

    /// Assemble the upstream messages for `messages`, whose last element is
    /// the pending user turn.
    ///
    /// Prior turns are forwarded verbatim. The pending turn becomes:
    /// text + up to `max_frames_per_request` frames when frames are
    /// attached, text + image when only an image is attached, or itself
    /// unchanged otherwise.
    pub fn assemble(
        &self,
        mut messages: Vec<ChatMessage>,
        context: &ChatContext,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let pending = messages
            .pop()
            .ok_or_else(|| CoreError::Validation("messages must not be empty".into()))?;

        let mut assembled = Vec::with_capacity(messages.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            assembled.push(ChatMessage {
                role: Role::System,
                content: MessageContent::Text(prompt.clone()),
            });
        }
        assembled.extend(messages);

        let final_turn = if !context.frames.is_empty() {
            let selected = &context.frames[..context.frames.len().min(self.max_frames_per_request)];
            tracing::info!(
                received = context.frames.len(),
                selected = selected.len(),
                "Attaching video frames",
            );

            let mut parts = Vec::with_capacity(selected.len() + 1);
            parts.push(ContentPart::Text {
                text: pending.content.text(),
            });
            parts.extend(selected.iter().map(|frame| ContentPart::image(frame)));
            ChatMessage::user(MessageContent::Parts(parts))
        } else if let Some(image) = context.file.as_deref() {
            ChatMessage::user(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: pending.content.text(),
                },
                ContentPart::image(image),
            ]))
        } else {
            pending
        };

        assembled.push(final_turn);
        Ok(assembled)
    }
}

/// Check that an attached image is an `http(s)` URL or a `data:` URL whose
/// MIME type corresponds to one of `allowed_extensions`.
pub fn validate_image_reference(url: &str, allowed_extensions: &[String]) -> Result<(), CoreError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(());
    }

    let mime = data_url::mime_of(url)
        .ok_or_else(|| CoreError::InvalidFormat("image must be a data URL or http(s) URL".into()))?;

    let allowed = extensions_for_mime(mime)
        .iter()
        .any(|ext| allowed_extensions.iter().any(|a| a.as_str() == *ext));
    if !allowed {
        return Err(CoreError::InvalidFormat(format!(
            "image type {mime} not allowed. Only {} allowed",
            allowed_extensions.join(", ")
        )));
    }
    Ok(())
}

fn extensions_for_mime(mime: &str) -> &'static [&'static str] {
    match mime.to_ascii_lowercase().as_str() {
        "image/png" => &[".png"],
        "image/jpeg" | "image/jpg" => &[".jpg", ".jpeg"],
        "image/gif" => &[".gif"],
        "image/webp" => &[".webp"],
        _ => &[],
    }
}
