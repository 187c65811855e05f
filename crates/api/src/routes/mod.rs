//! Route tree.
//!
//! ```text
//! GET  /health                 health_check
//! POST /chat/video/upload      upload_video   (multipart, field `video`)
//! POST /chat/stream            chat_stream    (JSON in, NDJSON out)
//! ```

pub mod chat;
pub mod health;
