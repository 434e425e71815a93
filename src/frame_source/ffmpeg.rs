//! ffmpeg rawvideo pipe
//!
//! Decoding is delegated to an ffmpeg child process that writes packed
//! RGB24 frames of a fixed size to stdout. The child is spawned with
//! `kill_on_drop(true)`, so dropping the pipe (including on task abort)
//! never leaves a stray ffmpeg behind.

use super::{CaptureError, Frame, PipeStats};
use chrono::Utc;
use image::RgbImage;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

pub struct FfmpegPipe {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FfmpegPipe {
    /// Spawn ffmpeg with the given input arguments, scaling to `width`x`height`
    pub fn spawn(
        ffmpeg_path: &str,
        input_args: &[String],
        width: u32,
        height: u32,
    ) -> Result<Self, CaptureError> {
        let scale = format!("scale={}:{}", width, height);
        let mut command = Command::new(ffmpeg_path);
        command
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(input_args)
            .args([
                "-an",
                "-vf",
                scale.as_str(),
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CaptureError::ReadFailed(format!("ffmpeg spawn failed: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::ReadFailed("ffmpeg stdout unavailable".into()))?;

        Ok(Self {
            child,
            stdout,
            width,
            height,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Read exactly one frame. EOF is reported as `ReadFailed("end of stream")`.
    pub async fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let mut buf = vec![0u8; self.frame_len()];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CaptureError::ReadFailed(END_OF_STREAM.into()));
            }
            Err(e) => return Err(CaptureError::ReadFailed(e.to_string())),
        }
        RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| CaptureError::ReadFailed("short frame buffer".into()))
    }

    /// Read one frame within `timeout`
    pub async fn read_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<RgbImage, CaptureError> {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| CaptureError::Timeout(timeout))?
    }

    /// Kill the child and reap it (bounded wait)
    pub async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!("ffmpeg did not exit after kill, dropping handle");
        }
    }
}

/// Open/read/close lifecycle around an optional pipe, shared by the sources
#[derive(Default)]
pub(super) struct PipeHandle {
    pipe: Option<FfmpegPipe>,
    /// First frame read while opening, handed out by the next `next()`
    pending: Option<Frame>,
    pub(super) stats: PipeStats,
}

impl PipeHandle {
    pub(super) fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    /// Spawn ffmpeg and wait for the first frame; the source only counts as
    /// open once a frame actually arrived.
    pub(super) async fn start(
        &mut self,
        ffmpeg_path: &str,
        input_args: &[String],
        resolution: (u32, u32),
        first_frame_timeout: Duration,
    ) -> Result<(), CaptureError> {
        self.stop().await;

        let mut pipe = FfmpegPipe::spawn(ffmpeg_path, input_args, resolution.0, resolution.1)?;
        match pipe.read_frame_timeout(first_frame_timeout).await {
            Ok(image) => {
                let frame = Frame::new(image, Utc::now());
                self.stats.record(frame.captured_at());
                self.pending = Some(frame);
                self.pipe = Some(pipe);
                Ok(())
            }
            Err(e) => {
                pipe.shutdown().await;
                Err(e)
            }
        }
    }

    /// Next frame; any failure closes the pipe
    pub(super) async fn next(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        let pipe = self.pipe.as_mut().ok_or(CaptureError::NotOpened)?;
        match pipe.read_frame_timeout(timeout).await {
            Ok(image) => {
                let frame = Frame::new(image, Utc::now());
                self.stats.record(frame.captured_at());
                Ok(frame)
            }
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    pub(super) async fn stop(&mut self) {
        self.pending = None;
        self.stats.rate.reset();
        if let Some(pipe) = self.pipe.take() {
            pipe.shutdown().await;
        }
    }
}

pub(crate) const END_OF_STREAM: &str = "end of stream";

pub(crate) fn is_end_of_stream(e: &CaptureError) -> bool {
    matches!(e, CaptureError::ReadFailed(msg) if msg == END_OF_STREAM)
}
