//! IP camera (RTSP or HTTP MJPEG)
//!
//! The endpoint is checked for reachability before ffmpeg is started so an
//! unreachable camera fails within `connect_timeout` instead of ffmpeg's own (much longer)
//! network timeouts. Reads discard corrupt frames and re-read.

use super::ffmpeg::PipeHandle;
use super::{redact_url, CaptureError, Frame, FrameSource, SourceStatus};
use crate::config_store::{CameraConfig, RtspTransport, SourceKind};
use crate::frame_validator::FrameValidator;
use async_trait::async_trait;
use std::time::Duration;

/// Re-reads before a read gives up with `Corrupt`
const MAX_CORRUPT_REREADS: u32 = 3;

pub struct IpSource {
    camera_id: String,
    url: String,
    transport: RtspTransport,
    resolution: (u32, u32),
    connect_timeout: Duration,
    ffmpeg_path: String,
    validator: FrameValidator,
    http: reqwest::Client,
    handle: PipeHandle,
    corrupt_discarded: u64,
}

impl IpSource {
    pub fn new(camera_id: &str, url: String, config: &CameraConfig, ffmpeg_path: &str) -> Self {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(connect_timeout)
            .build()
            .unwrap_or_default();

        Self {
            camera_id: camera_id.to_string(),
            url,
            transport: config.transport,
            resolution: config.resolution,
            connect_timeout,
            ffmpeg_path: ffmpeg_path.to_string(),
            validator: FrameValidator::default(),
            http,
            handle: PipeHandle::default(),
            corrupt_discarded: 0,
        }
    }

    pub fn corrupt_discarded(&self) -> u64 {
        self.corrupt_discarded
    }

    fn is_rtsp(&self) -> bool {
        self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://")
    }

    fn input_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_rtsp() {
            args.extend([
                "-rtsp_transport".to_string(),
                self.transport.as_str().to_string(),
                // socket timeout, microseconds
                "-timeout".to_string(),
                (self.connect_timeout.as_micros() as u64).to_string(),
            ]);
        }
        args.extend(["-fflags".to_string(), "nobuffer".to_string()]);
        args.extend(["-i".to_string(), self.url.clone()]);
        args
    }

    /// Reachability check before spawning the decoder
    async fn check_reachable(&self) -> Result<(), CaptureError> {
        let parsed = reqwest::Url::parse(&self.url)
            .map_err(|e| {
                CaptureError::NotConfigured(format!("{}: bad url: {}", self.camera_id, e))
            })?;

        match parsed.scheme() {
            "http" | "https" => {
                let resp = self
                    .http
                    .get(parsed)
                    .send()
                    .await
                    .map_err(|e| {
                        CaptureError::ReadFailed(format!("http reachability check failed: {}", e))
                    })?;
                if !resp.status().is_success() {
                    return Err(CaptureError::ReadFailed(format!(
                        "http reachability check returned {}",
                        resp.status()
                    )));
                }
                Ok(())
            }
            _ => {
                let host = parsed
                    .host_str()
                    .ok_or_else(|| {
                        CaptureError::NotConfigured(format!("{}: url has no host", self.camera_id))
                    })?
                    .to_string();
                let port = parsed.port().unwrap_or(554);
                match tokio::time::timeout(
                    self.connect_timeout,
                    tokio::net::TcpStream::connect((host.as_str(), port)),
                )
                .await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(CaptureError::ReadFailed(format!(
                        "{}:{} unreachable: {}",
                        host, port, e
                    ))),
                    Err(_) => Err(CaptureError::Timeout(self.connect_timeout)),
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for IpSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn open(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_open() {
            return Ok(());
        }
        self.check_reachable().await?;

        let args = self.input_args();
        self.handle
            .start(&self.ffmpeg_path, &args, self.resolution, self.connect_timeout)
            .await?;
        tracing::info!(
            camera_id = %self.camera_id,
            url = %redact_url(&self.url),
            transport = self.transport.as_str(),
            "IP camera opened"
        );
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        let mut last_reason = String::new();
        for _ in 0..MAX_CORRUPT_REREADS {
            let frame = self.handle.next(self.connect_timeout).await?;
            match self.validator.check_corruption(frame.image()) {
                None => return Ok(frame),
                Some(reason) => {
                    self.corrupt_discarded += 1;
                    tracing::debug!(
                        camera_id = %self.camera_id,
                        reason = %reason,
                        "Corrupt frame discarded"
                    );
                    last_reason = reason.to_string();
                }
            }
        }
        Err(CaptureError::Corrupt(last_reason))
    }

    async fn release(&mut self) {
        if self.handle.is_open() {
            tracing::debug!(camera_id = %self.camera_id, "IP camera released");
        }
        self.handle.stop().await;
    }

    fn describe(&self) -> SourceStatus {
        SourceStatus {
            camera_id: self.camera_id.clone(),
            kind: SourceKind::Ip,
            target: redact_url(&self.url),
            opened: self.handle.is_open(),
            resolution: self.resolution,
            frames_read: self.handle.stats.frames_read,
            last_frame_at: self.handle.stats.last_frame_at,
            fps: self.handle.stats.rate.fps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> IpSource {
        let config = CameraConfig {
            kind: SourceKind::Ip,
            url: Some(url.to_string()),
            transport: RtspTransport::Udp,
            connect_timeout_secs: 1,
            ..Default::default()
        };
        IpSource::new("L1_ip_0", url.to_string(), &config, "ffmpeg")
    }

    #[test]
    fn test_rtsp_args_carry_transport() {
        let args = source("rtsp://10.0.0.5/stream1").input_args();
        let pos = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[pos + 1], "udp");
        assert_eq!(args.last().unwrap(), "rtsp://10.0.0.5/stream1");
    }

    #[test]
    fn test_http_args_skip_rtsp_options() {
        let args = source("http://10.0.0.5/video.mjpg").input_args();
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[tokio::test]
    async fn test_read_before_open_is_not_opened() {
        let mut src = source("rtsp://10.0.0.5/stream1");
        assert_eq!(src.read().await.unwrap_err(), CaptureError::NotOpened);
        src.release().await;
        assert!(!src.describe().opened);
    }

    #[tokio::test]
    async fn test_reachability_rejects_bad_url() {
        let src = source("not a url");
        assert!(matches!(src.check_reachable().await, Err(CaptureError::NotConfigured(_))));
    }
}
