//! Video file played back as a camera; loops to the start on EOF

use super::ffmpeg::{is_end_of_stream, PipeHandle};
use super::{CaptureError, Frame, FrameSource, SourceStatus};
use crate::config_store::{CameraConfig, SourceKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

pub struct VideoFileSource {
    camera_id: String,
    path: PathBuf,
    resolution: (u32, u32),
    ffmpeg_path: String,
    read_timeout: Duration,
    handle: PipeHandle,
    loops: u64,
}

impl VideoFileSource {
    pub fn new(camera_id: &str, path: PathBuf, config: &CameraConfig, ffmpeg_path: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            path,
            resolution: config.resolution,
            ffmpeg_path: ffmpeg_path.to_string(),
            read_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            handle: PipeHandle::default(),
            loops: 0,
        }
    }

    pub fn loops(&self) -> u64 {
        self.loops
    }

    fn input_args(&self) -> Vec<String> {
        // -re paces decoding at the file's native frame rate
        vec![
            "-re".into(),
            "-i".into(),
            self.path.to_string_lossy().into_owned(),
        ]
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        let args = self.input_args();
        self.handle
            .start(&self.ffmpeg_path, &args, self.resolution, self.read_timeout)
            .await
    }
}

#[async_trait]
impl FrameSource for VideoFileSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_open() {
            return Ok(());
        }
        if !self.path.is_file() {
            return Err(CaptureError::NotConfigured(format!(
                "{}: {} is not a file",
                self.camera_id,
                self.path.display()
            )));
        }
        self.start().await?;
        tracing::info!(
            camera_id = %self.camera_id,
            path = %self.path.display(),
            "Video source opened"
        );
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        match self.handle.next(self.read_timeout).await {
            Err(e) if is_end_of_stream(&e) => {
                self.loops += 1;
                tracing::debug!(camera_id = %self.camera_id, loops = self.loops, "Video looped");
                self.start().await?;
                self.handle.next(self.read_timeout).await
            }
            other => other,
        }
    }

    async fn release(&mut self) {
        self.handle.stop().await;
    }

    fn describe(&self) -> SourceStatus {
        SourceStatus {
            camera_id: self.camera_id.clone(),
            kind: SourceKind::Video,
            target: self.path.display().to_string(),
            opened: self.handle.is_open(),
            resolution: self.resolution,
            frames_read: self.handle.stats.frames_read,
            last_frame_at: self.handle.stats.last_frame_at,
            fps: self.handle.stats.rate.fps(),
        }
    }
}
