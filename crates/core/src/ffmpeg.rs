//! FFmpeg/FFprobe command utilities.
//!
//! `ffprobe` supplies the stream geometry and native frame rate; `ffmpeg`
//! decodes the first video stream to raw RGB24 frames on a pipe, which
//! [`RawFrameReader`] slices into [`RawFrame`]s one at a time.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use serde::Deserialize;

use crate::error::CoreError;

/// Error type for FFmpeg/FFprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("video file not found: {0}")]
    VideoNotFound(String),

    #[error("no video stream in {0}")]
    NoVideoStream(String),
}

impl From<FfmpegError> for CoreError {
    fn from(err: FfmpegError) -> Self {
        match err {
            FfmpegError::NotFound(_) | FfmpegError::IoError(_) => {
                CoreError::Internal(err.to_string())
            }
            FfmpegError::ExecutionFailed { .. }
            | FfmpegError::ParseError(_)
            | FfmpegError::VideoNotFound(_)
            | FfmpegError::NoVideoStream(_) => CoreError::UnreadableVideo(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: Option<FfprobeFormat>,
}

/// A single stream from ffprobe output.
#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// e.g. "30/1" or "24000/1001"
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub duration: Option<String>,
    pub nb_frames: Option<String>,
}

/// Format-level metadata from ffprobe.
#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

/// The facts about a video the frame sampler needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Native frame rate; `0.0` when the container does not report one.
    pub fps: f64,
    /// Reported or estimated frame count; `0` when unknown.
    pub total_frames: u64,
    pub duration_secs: f64,
}

/// One decoded frame as tightly packed RGB24 pixels.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run `ffprobe` on a video file and return the parsed JSON output.
pub async fn probe_video(path: &Path) -> Result<FfprobeOutput, FfmpegError> {
    if !path.exists() {
        return Err(FfmpegError::VideoNotFound(
            path.to_string_lossy().to_string(),
        ));
    }

    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;

    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str::<FfprobeOutput>(&stdout)
        .map_err(|e| FfmpegError::ParseError(format!("{e}: {stdout}")))
}

/// Probe `path` and reduce the output to a [`VideoInfo`].
pub async fn video_info(path: &Path) -> Result<VideoInfo, FfmpegError> {
    let probe = probe_video(path).await?;
    let (width, height) = parse_resolution(&probe);
    if width == 0 || height == 0 {
        return Err(FfmpegError::NoVideoStream(
            path.to_string_lossy().to_string(),
        ));
    }

    Ok(VideoInfo {
        width,
        height,
        fps: parse_framerate(&probe),
        total_frames: parse_total_frames(&probe),
        duration_secs: parse_duration(&probe),
    })
}

/// Sequential reader over the decoded frames of a video's first video stream.
///
/// Blocking: drive it from a blocking worker, never from an async task.
pub struct RawFrameReader {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl RawFrameReader {
    /// Spawn `ffmpeg` decoding `path` to RGB24 at `width` x `height`.
    ///
    /// Auto-rotation is disabled so the decoded geometry always matches
    /// the probed stream dimensions.
    pub fn spawn(path: &Path, width: u32, height: u32) -> Result<Self, FfmpegError> {
        Self::spawn_program(OsStr::new("ffmpeg"), path, width, height)
    }

    fn spawn_program(
        program: &OsStr,
        path: &Path,
        width: u32,
        height: u32,
    ) -> Result<Self, FfmpegError> {
        let mut child = Command::new(program)
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args([
                "-map",
                "0:v:0",
                "-vsync",
                "passthrough",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(FfmpegError::NotFound)?;

        let stdout = child.stdout.take();
        let stderr_tail = match child.stderr.take() {
            Some(pipe) => match drain_stderr(pipe) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Self {
            child,
            stdout,
            stderr_tail,
            width,
            height,
            frames_read: 0,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Reap the child once stdout is exhausted. Only a failure before any
    /// frame was produced is reported; a decoder error after that point
    /// ends the stream like end-of-file.
    fn finish(&mut self) -> Option<Result<RawFrame, FfmpegError>> {
        self.stdout = None;

        let status = self.child.wait();
        let stderr = self
            .stderr_tail
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        match status {
            Ok(status) if status.success() => None,
            Ok(status) if self.frames_read == 0 => Some(Err(FfmpegError::ExecutionFailed {
                exit_code: status.code(),
                stderr,
            })),
            Ok(status) => {
                tracing::warn!(
                    exit_code = ?status.code(),
                    frames_read = self.frames_read,
                    stderr = %stderr.trim(),
                    "ffmpeg stopped early; keeping frames decoded so far",
                );
                None
            }
            Err(e) => Some(Err(FfmpegError::IoError(e))),
        }
    }
}

impl Iterator for RawFrameReader {
    type Item = Result<RawFrame, FfmpegError>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame_len = self.frame_len();
        let stdout = self.stdout.as_mut()?;

        let mut data = vec![0u8; frame_len];
        match read_full(stdout, &mut data) {
            Ok(n) if n == frame_len => {
                self.frames_read += 1;
                Some(Ok(RawFrame {
                    width: self.width,
                    height: self.height,
                    data,
                }))
            }
            Ok(0) => self.finish(),
            Ok(n) => {
                tracing::warn!(bytes = n, expected = frame_len, "Discarding truncated trailing frame");
                self.finish()
            }
            Err(e) => {
                self.stdout = None;
                Some(Err(FfmpegError::IoError(e)))
            }
        }
    }
}

impl Drop for RawFrameReader {
    fn drop(&mut self) {
        if self.stdout.is_some() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Maximum number of trailing stderr bytes kept for error reports.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Read ffmpeg's stderr to EOF on its own thread, keeping only the last
/// [`STDERR_TAIL_BYTES`]. The pipe must never fill up while the reader is
/// blocked on stdout.
fn drain_stderr(mut pipe: ChildStderr) -> Result<JoinHandle<String>, FfmpegError> {
    let handle = std::thread::Builder::new()
        .name("ffmpeg-stderr".into())
        .spawn(move || {
            let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL_BYTES);
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tail.extend(&buf[..n]);
                        let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                        tail.drain(..excess);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(tail.make_contiguous()).into_owned()
        })?;
    Ok(handle)
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Find the first video stream in the ffprobe output.
fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// Parse the video duration in seconds from ffprobe output.
pub fn parse_duration(probe: &FfprobeOutput) -> f64 {
    let from_format = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    if let Some(secs) = from_format {
        return secs;
    }
    first_video_stream(probe)
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Parse the native frame rate, preferring `avg_frame_rate` over
/// `r_frame_rate`. Returns `0.0` when neither is usable.
pub fn parse_framerate(probe: &FfprobeOutput) -> f64 {
    let Some(stream) = first_video_stream(probe) else {
        return 0.0;
    };
    [stream.avg_frame_rate.as_deref(), stream.r_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .map(parse_fraction)
        .find(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(0.0)
}

/// Parse a fraction string like `"30/1"` into a float.
fn parse_fraction(s: &str) -> f64 {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num = parts[0].parse::<f64>().unwrap_or(0.0);
        let den = parts[1].parse::<f64>().unwrap_or(1.0);
        if den > 0.0 {
            return num / den;
        }
        return 0.0;
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// Count total frames from ffprobe output.
pub fn parse_total_frames(probe: &FfprobeOutput) -> u64 {
    let reported = first_video_stream(probe)
        .and_then(|s| s.nb_frames.as_deref())
        .and_then(|nb| nb.parse::<u64>().ok());
    if let Some(n) = reported {
        return n;
    }
    let duration = parse_duration(probe);
    let fps = parse_framerate(probe);
    if duration > 0.0 && fps > 0.0 {
        return (duration * fps).round() as u64;
    }
    0
}

/// Find the first video stream's resolution.
pub fn parse_resolution(probe: &FfprobeOutput) -> (u32, u32) {
    first_video_stream(probe)
        .map(|s| (s.width.unwrap_or(0), s.height.unwrap_or(0)))
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_stream(r_frame_rate: Option<&str>, avg_frame_rate: Option<&str>) -> FfprobeStream {
        FfprobeStream {
            codec_type: Some("video".into()),
            width: Some(1920),
            height: Some(1080),
            r_frame_rate: r_frame_rate.map(Into::into),
            avg_frame_rate: avg_frame_rate.map(Into::into),
            duration: None,
            nb_frames: None,
        }
    }

    fn probe_with(stream: FfprobeStream, duration: Option<&str>) -> FfprobeOutput {
        FfprobeOutput {
            streams: vec![stream],
            format: Some(FfprobeFormat {
                duration: duration.map(Into::into),
            }),
        }
    }

    #[test]
    fn test_parse_fraction_standard() {
        assert!((parse_fraction("30/1") - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_fraction_ntsc() {
        let fps = parse_fraction("30000/1001");
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_fraction_zero_denominator() {
        assert!((parse_fraction("0/0") - 0.0).abs() < 0.001);
        assert!((parse_fraction("30/0") - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_framerate_prefers_average_rate() {
        let probe = probe_with(video_stream(Some("60/1"), Some("30/1")), None);
        assert!((parse_framerate(&probe) - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_framerate_falls_back_when_average_is_zero() {
        let probe = probe_with(video_stream(Some("25/1"), Some("0/0")), None);
        assert!((parse_framerate(&probe) - 25.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_framerate_without_video_stream() {
        let probe = FfprobeOutput {
            streams: vec![],
            format: None,
        };
        assert_eq!(parse_framerate(&probe), 0.0);
        assert_eq!(parse_resolution(&probe), (0, 0));
    }

    #[test]
    fn test_parse_total_frames_from_nb_frames() {
        let mut stream = video_stream(Some("30/1"), None);
        stream.nb_frames = Some("300".into());
        let probe = probe_with(stream, Some("10.0"));
        assert_eq!(parse_total_frames(&probe), 300);
    }

    #[test]
    fn test_parse_total_frames_estimated() {
        let probe = probe_with(video_stream(Some("30/1"), None), Some("10.0"));
        assert_eq!(parse_total_frames(&probe), 300);
    }

    #[test]
    fn test_parse_duration_from_stream() {
        let mut stream = video_stream(Some("30/1"), None);
        stream.duration = Some("60.0".into());
        let probe = probe_with(stream, None);
        assert!((parse_duration(&probe) - 60.0).abs() < 0.001);
    }

    #[test]
    fn test_deserialize_ffprobe_json() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "audio", "sample_rate": "48000"},
                {"index": 1, "codec_type": "video", "width": 640, "height": 360,
                 "r_frame_rate": "30/1", "avg_frame_rate": "30/1", "nb_frames": "90"}
            ],
            "format": {"duration": "3.000000", "format_name": "mov,mp4"}
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(parse_resolution(&probe), (640, 360));
        assert_eq!(parse_total_frames(&probe), 90);
        assert!((parse_duration(&probe) - 3.0).abs() < 0.001);
    }

    #[test]
    fn test_ffmpeg_errors_map_to_unreadable_video() {
        let err: CoreError = FfmpegError::ExecutionFailed {
            exit_code: Some(1),
            stderr: "moov atom not found".into(),
        }
        .into();
        assert!(matches!(err, CoreError::UnreadableVideo(_)));

        let err: CoreError = FfmpegError::NotFound(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        ))
        .into();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    /// Write an executable shell script standing in for `ffmpeg`.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("ffmpeg");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    /// Drain `reader` on a separate thread, failing the test if it stalls.
    #[cfg(unix)]
    fn collect_with_deadline(
        reader: RawFrameReader,
    ) -> Vec<Result<RawFrame, FfmpegError>> {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(reader.collect::<Vec<_>>());
        });
        rx.recv_timeout(std::time::Duration::from_secs(10))
            .expect("frame reader stalled")
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_stderr_does_not_block_frame_reading() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(
            dir.path(),
            "head -c 200000 /dev/zero >&2\nhead -c 12 /dev/zero\nexit 0",
        );

        let reader =
            RawFrameReader::spawn_program(program.as_os_str(), Path::new("in.mp4"), 2, 2).unwrap();
        let frames = collect_with_deadline(reader);

        assert_eq!(frames.len(), 1);
        let frame = frames.into_iter().next().unwrap().unwrap();
        assert_eq!((frame.width, frame.height, frame.data.len()), (2, 2, 12));
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_before_first_frame_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(
            dir.path(),
            "head -c 100000 /dev/zero | tr '\\000' x >&2\necho 'moov atom not found' >&2\nexit 1",
        );

        let reader =
            RawFrameReader::spawn_program(program.as_os_str(), Path::new("in.mp4"), 2, 2).unwrap();
        let mut frames = collect_with_deadline(reader);

        assert_eq!(frames.len(), 1);
        match frames.remove(0) {
            Err(FfmpegError::ExecutionFailed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.len() <= STDERR_TAIL_BYTES);
                assert!(stderr.trim_end().ends_with("moov atom not found"), "{stderr}");
            }
            other => panic!("expected ExecutionFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_read_full_stops_at_end_of_stream() {
        let mut src: &[u8] = &[1, 2, 3, 4, 5];
        let mut buf = [0u8; 3];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 3);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 2);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 0);
    }
}
