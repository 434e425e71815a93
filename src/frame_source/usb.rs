//! Local USB camera through v4l2

use super::ffmpeg::PipeHandle;
use super::{CaptureError, Frame, FrameSource, SourceStatus};
use crate::config_store::{CameraConfig, SourceKind};
use async_trait::async_trait;
use std::time::Duration;

pub struct UsbSource {
    camera_id: String,
    device: u32,
    resolution: (u32, u32),
    fps: u32,
    ffmpeg_path: String,
    open_timeout: Duration,
    handle: PipeHandle,
}

impl UsbSource {
    pub fn new(camera_id: &str, device: u32, config: &CameraConfig, ffmpeg_path: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            device,
            resolution: config.resolution,
            fps: config.fps.max(1),
            ffmpeg_path: ffmpeg_path.to_string(),
            open_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            handle: PipeHandle::default(),
        }
    }

    fn device_path(&self) -> String {
        format!("/dev/video{}", self.device)
    }

    fn input_args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            "v4l2".into(),
            "-framerate".into(),
            self.fps.to_string(),
            "-video_size".into(),
            format!("{}x{}", self.resolution.0, self.resolution.1),
            "-i".into(),
            self.device_path(),
        ]
    }

    /// A few frame periods, never below one second
    fn read_timeout(&self) -> Duration {
        Duration::from_millis((3000 / self.fps as u64).max(1000))
    }
}

#[async_trait]
impl FrameSource for UsbSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_open() {
            return Ok(());
        }
        if !std::path::Path::new(&self.device_path()).exists() {
            return Err(CaptureError::NotConfigured(format!(
                "{}: {} does not exist",
                self.camera_id,
                self.device_path()
            )));
        }
        let args = self.input_args();
        self.handle
            .start(&self.ffmpeg_path, &args, self.resolution, self.open_timeout)
            .await?;
        tracing::info!(
            camera_id = %self.camera_id,
            device = %self.device_path(),
            width = self.resolution.0,
            height = self.resolution.1,
            fps = self.fps,
            "USB camera opened"
        );
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        let timeout = self.read_timeout();
        self.handle.next(timeout).await
    }

    async fn release(&mut self) {
        if self.handle.is_open() {
            tracing::debug!(camera_id = %self.camera_id, "USB camera released");
        }
        self.handle.stop().await;
    }

    fn describe(&self) -> SourceStatus {
        SourceStatus {
            camera_id: self.camera_id.clone(),
            kind: SourceKind::Usb,
            target: self.device_path(),
            opened: self.handle.is_open(),
            resolution: self.resolution,
            frames_read: self.handle.stats.frames_read,
            last_frame_at: self.handle.stats.last_frame_at,
            fps: self.handle.stats.rate.fps(),
        }
    }
}
