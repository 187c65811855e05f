//! Core domain logic for the chatvision relay.
//!
//! Upload guarding, ffmpeg-backed frame sampling, and chat request
//! assembly. No HTTP or upstream-client types live here; the `api`,
//! `cloud` and `llm` crates build on these pieces.

pub mod chat;
pub mod data_url;
pub mod error;
pub mod ffmpeg;
pub mod frames;
pub mod upload;
