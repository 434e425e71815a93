//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, loaded once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub capture: CaptureConfig,
    pub processing: ProcessingConfig,
    pub circuit_breaker: BreakerConfig,
    /// Explicit processor identity (random when absent)
    pub processor_id: Option<String>,
    pub lines: Vec<LineConfig>,
}

impl AppConfig {
    pub fn line_ids(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://linewatch.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of per-line batch directories
    pub frames_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub quarantine_enabled: bool,
    pub delete_after_process: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            frames_dir: PathBuf::from("frames"),
            quarantine_dir: PathBuf::from("quarantine"),
            quarantine_enabled: true,
            delete_after_process: true,
        }
    }
}

/// Capture trigger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Interval,
    Motion,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Interval => "interval",
            CaptureMode::Motion => "motion",
        }
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(CaptureMode::Interval),
            "motion" => Ok(CaptureMode::Motion),
            other => Err(format!("unknown capture mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub mode: CaptureMode,
    /// Seconds between interval captures
    pub interval_secs: f64,
    /// Batch window length
    pub window_secs: u64,
    pub buffer_capacity: usize,
    pub stop_timeout_ms: u64,
    /// Consecutive read failures before the source is reopened
    pub max_consecutive_errors: u32,
    pub reconnect_delay_ms: u64,
    /// Reopen attempts at `reconnect_delay_ms` before backing off further
    pub max_rapid_reconnects: u32,
    pub ffmpeg_path: String,
    /// Concurrent frame encode/write jobs
    pub workers: usize,
    pub jpeg_quality: u8,
    /// Drop frames whose sharpness is below `min_sharpness`
    pub reject_blurry: bool,
    pub min_sharpness: f64,
    pub motion: MotionConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CaptureMode::Interval,
            interval_secs: 1.0,
            window_secs: 60,
            buffer_capacity: 2,
            stop_timeout_ms: 5000,
            max_consecutive_errors: 5,
            reconnect_delay_ms: 2000,
            max_rapid_reconnects: 10,
            ffmpeg_path: "ffmpeg".to_string(),
            workers: 4,
            jpeg_quality: 90,
            reject_blurry: false,
            min_sharpness: 100.0,
            motion: MotionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Total contour area (pixels) that counts as motion
    pub threshold: f64,
    /// Contours smaller than this are noise
    pub min_area: f64,
    pub burst_frames: u32,
    pub burst_interval_ms: u64,
    pub check_interval_ms: u64,
    pub blur_sigma: f32,
    pub pixel_threshold: u8,
    pub dilate_radius: u8,
    pub annotate: bool,
    /// Concurrent motion comparisons
    pub workers: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: 20000.0,
            min_area: 500.0,
            burst_frames: 5,
            burst_interval_ms: 100,
            check_interval_ms: 200,
            blur_sigma: 3.5,
            pixel_threshold: 25,
            dilate_radius: 2,
            annotate: false,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub poll_jitter_ms: u64,
    /// Batches claimed per line per cycle
    pub claim_batch_size: u32,
    pub lock_timeout_secs: u64,
    pub min_images_per_batch: usize,
    pub max_workers: usize,
    pub face_match_tolerance: f32,
    pub max_image_dimension: u32,
    pub embedding_url: String,
    pub embedding_timeout_secs: u64,
    pub metrics_interval_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
            poll_jitter_ms: 1000,
            claim_batch_size: 4,
            lock_timeout_secs: 300,
            min_images_per_batch: 3,
            max_workers: 4,
            face_match_tolerance: 0.6,
            max_image_dimension: 800,
            embedding_url: "http://localhost:9000".to_string(),
            embedding_timeout_secs: 30,
            metrics_interval_secs: 60,
            max_backoff_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

/// One production line and its cameras
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub id: String,
    pub cameras: Vec<CameraConfig>,
}

/// Source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Usb,
    Ip,
    Video,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Usb => "usb",
            SourceKind::Ip => "ip",
            SourceKind::Video => "video",
        }
    }
}

/// RTSP transport for IP sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// USB device index (/dev/videoN)
    pub device: Option<u32>,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    /// Role/position tag used in frame filenames
    pub position: Option<String>,
    pub resolution: (u32, u32),
    pub fps: u32,
    pub transport: RtspTransport,
    pub connect_timeout_secs: u64,
    /// Delay between reopen attempts; `capture.reconnect_delay_ms` when unset
    pub reconnect_interval_secs: Option<f64>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: None,
            kind: SourceKind::Usb,
            device: None,
            url: None,
            path: None,
            position: None,
            resolution: (640, 480),
            fps: 15,
            transport: RtspTransport::Tcp,
            connect_timeout_secs: 10,
            reconnect_interval_secs: None,
        }
    }
}

impl CameraConfig {
    /// Stable id: explicit `id`, else `{line}_{type}_{index}`
    pub fn camera_id(&self, line_id: &str, index: usize) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("{}_{}_{}", line_id, self.kind.as_str(), index),
        }
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_interval_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn position_or(&self, camera_id: &str) -> String {
        self.position
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| camera_id.to_string())
    }
}
