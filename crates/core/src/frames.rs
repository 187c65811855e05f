//! Frame sampling: turns a video file into an ordered set of JPEG data URLs.
//!
//! Decoding and JPEG encoding are CPU-bound, so [`FrameSampler::extract`]
//! runs them on tokio's blocking pool. A semaphore caps how many videos are
//! decoded at once; callers wait asynchronously for a permit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::sync::Semaphore;

use crate::data_url;
use crate::error::CoreError;
use crate::ffmpeg::{self, RawFrame, RawFrameReader};

/// JPEG quality used for every extracted frame.
pub const JPEG_QUALITY: u8 = 85;

/// Default extraction rate in frames per second.
pub const DEFAULT_TARGET_FPS: f64 = 1.0;

/// Sampled frames as `data:image/jpeg;base64,...` strings, in temporal order.
pub type FrameSet = Vec<String>;

/// Extracts frames from video files at a fixed target rate.
///
/// Built once at startup and shared; cloning is cheap.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    target_fps: f64,
    permits: Arc<Semaphore>,
}

impl FrameSampler {
    /// `max_concurrent` bounds the number of videos decoded in parallel.
    pub fn new(target_fps: f64, max_concurrent: usize) -> Self {
        Self {
            target_fps,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Probe, decode and sample `video_path`.
    ///
    /// Fails with [`CoreError::UnreadableVideo`] when the file cannot be
    /// opened and [`CoreError::NoFramesExtracted`] when nothing qualifies.
    pub async fn extract(&self, video_path: &Path) -> Result<FrameSet, CoreError> {
        let info = ffmpeg::video_info(video_path).await?;
        let interval = sampling_interval(info.fps, self.target_fps);

        tracing::info!(
            duration_secs = %format!("{:.2}", info.duration_secs),
            native_fps = info.fps,
            total_frames = info.total_frames,
            target_fps = self.target_fps,
            interval,
            "Extracting frames",
        );

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| CoreError::Internal(format!("frame worker pool closed: {e}")))?;

        let path: PathBuf = video_path.to_path_buf();
        let (width, height) = (info.width, info.height);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let reader = RawFrameReader::spawn(&path, width, height)?;
            sample_frames(reader.map(|frame| frame.map_err(CoreError::from)), interval)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("Frame extraction task failed: {e}")))?
    }
}

/// Number of decoded frames between two extracted frames.
///
/// `round(native_fps / target_fps)`, never less than 1. An unknown or zero
/// native rate takes every frame.
pub fn sampling_interval(native_fps: f64, target_fps: f64) -> usize {
    if !native_fps.is_finite() || native_fps <= 0.0 || !target_fps.is_finite() || target_fps <= 0.0
    {
        return 1;
    }
    ((native_fps / target_fps).round() as usize).max(1)
}

/// Keep every `interval`-th frame (starting with the first) and encode it.
///
/// A decode error after at least one frame has been kept ends sampling
/// early; the frames gathered so far are returned. An error before that is
/// returned as-is.
pub fn sample_frames<I>(frames: I, interval: usize) -> Result<FrameSet, CoreError>
where
    I: IntoIterator<Item = Result<RawFrame, CoreError>>,
{
    let interval = interval.max(1);
    let mut selected = FrameSet::new();
    let mut decoded: usize = 0;

    for frame in frames {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if selected.is_empty() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, decoded, "Decode failed mid-stream; stopping");
                break;
            }
        };

        if decoded % interval == 0 {
            selected.push(encode_jpeg_data_url(&frame)?);
        }
        decoded += 1;
    }

    tracing::info!(
        extracted = selected.len(),
        decoded,
        "Extracted frames from video",
    );

    if selected.is_empty() {
        return Err(CoreError::NoFramesExtracted);
    }
    Ok(selected)
}

/// Encode one RGB24 frame as a JPEG data URL.
pub fn encode_jpeg_data_url(frame: &RawFrame) -> Result<String, CoreError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| CoreError::Internal(format!("JPEG encoding failed: {e}")))?;
    Ok(data_url::encode("image/jpeg", &jpeg))
}
