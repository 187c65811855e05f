//! NDJSON relay from an upstream completion stream to the client.
//!
//! Each upstream event with at least one choice becomes one line holding
//! that choice's JSON. If opening or reading the upstream fails, a single
//! `{"error": message}` line is emitted and the relay ends. Errors never
//! escape as stream failures, so a response that has already started is
//! always terminated cleanly.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use futures::{FutureExt, StreamExt};
use serde::Serialize;

use crate::api::{ChunkStream, UpstreamError};

enum RelayState {
    Opening(BoxFuture<'static, Result<ChunkStream, UpstreamError>>),
    Streaming(ChunkStream),
    Finished,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    error: &'a str,
}

/// Relay the stream produced by `open` as newline-terminated JSON lines.
///
/// Nothing is requested until the returned stream is first polled, and
/// dropping it stops reading from the upstream.
pub fn relay<F>(open: F) -> impl Stream<Item = Bytes> + Send + 'static
where
    F: std::future::Future<Output = Result<ChunkStream, UpstreamError>> + Send + 'static,
{
    stream::unfold(RelayState::Opening(open.boxed()), |state| async move {
        let mut upstream = match state {
            RelayState::Opening(open) => match open.await {
                Ok(upstream) => upstream,
                Err(e) => return Some((error_line(&e), RelayState::Finished)),
            },
            RelayState::Streaming(upstream) => upstream,
            RelayState::Finished => return None,
        };

        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    let Some(choice) = chunk.choices.into_iter().next() else {
                        continue;
                    };
                    return Some((json_line(&choice), RelayState::Streaming(upstream)));
                }
                Some(Err(e)) => return Some((error_line(&e), RelayState::Finished)),
                None => {
                    tracing::debug!("Completion stream finished");
                    return None;
                }
            }
        }
    })
}

fn json_line<T: Serialize>(value: &T) -> Bytes {
    // Serializing a `serde_json::Value` or a struct of strings cannot fail.
    let mut line = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

fn error_line(error: &UpstreamError) -> Bytes {
    tracing::warn!(error = %error, "Completion stream failed");
    json_line(&ErrorLine {
        error: &error.to_string(),
    })
}
