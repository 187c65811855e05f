//! Durable storage for uploaded originals.
//!
//! Wraps an S3-compatible object store behind [`storage::VideoStore`].

pub mod storage;

pub use storage::{StorageConfig, StorageError, VideoStore};
