//! Camera registry types

use crate::config_store::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Never opened yet
    Unknown,
    /// Source open and delivering frames
    Online,
    /// Open failed or source lost
    Offline,
}

/// Camera status transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatusEvent {
    /// Camera went from Online (or Unknown) to Offline
    Lost,
    /// Camera went from Offline to Online
    Recovered,
}

/// Identity of a camera, fixed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraIdentity {
    pub camera_id: String,
    pub line_id: String,
    pub kind: SourceKind,
    /// Device path, redacted URL or file path
    pub target: String,
    pub position: String,
}

/// Counters pushed by the capture loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureCounters {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub duplicates_discarded: u64,
    pub corrupt_discarded: u64,
    pub fps: f64,
}

/// Live state of one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraState {
    pub identity: CameraIdentity,
    pub connection: ConnectionStatus,
    pub counters: CaptureCounters,
    pub reconnects: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status_changed_at: DateTime<Utc>,
}

impl CameraState {
    pub fn new(identity: CameraIdentity) -> Self {
        Self {
            identity,
            connection: ConnectionStatus::Unknown,
            counters: CaptureCounters::default(),
            reconnects: 0,
            last_frame_at: None,
            last_error: None,
            status_changed_at: Utc::now(),
        }
    }
}
