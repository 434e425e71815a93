//! CameraRegistry - live state of every configured camera
//!
//! ## Responsibilities
//!
//! - One entry per camera, keyed by its stable camera id
//! - Connection status tracking with Lost/Recovered transition events
//!   (only transitions are logged)
//! - Capture counters (frames, drops, duplicates, fps, reconnects)
//!
//! Owned by the capture subsystem and passed explicitly to every component
//! that reports or reads camera status.

mod types;

pub use types::*;

use crate::frame_source::CaptureError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct CameraRegistry {
    cameras: RwLock<HashMap<String, CameraState>>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, identity: CameraIdentity) {
        let camera_id = identity.camera_id.clone();
        tracing::info!(
            camera_id = %camera_id,
            line_id = %identity.line_id,
            kind = identity.kind.as_str(),
            target = %identity.target,
            "Camera registered"
        );
        self.cameras
            .write()
            .await
            .insert(camera_id, CameraState::new(identity));
    }

    pub async fn contains(&self, camera_id: &str) -> bool {
        self.cameras.read().await.contains_key(camera_id)
    }

    /// Update connection status and return the transition event, if any
    ///
    /// - `Some(Lost)` on Online -> Offline, and on a first status of Offline
    /// - `Some(Recovered)` on Offline -> Online
    /// - `None` otherwise
    pub async fn update_connection(
        &self,
        camera_id: &str,
        online: bool,
        error: Option<&str>,
    ) -> Result<Option<CameraStatusEvent>, CaptureError> {
        let mut cameras = self.cameras.write().await;
        let state = cameras
            .get_mut(camera_id)
            .ok_or_else(|| CaptureError::NotConfigured(camera_id.to_string()))?;

        let prev = state.connection;
        let next = if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        if let Some(error) = error {
            state.last_error = Some(error.to_string());
        }
        if prev == next {
            return Ok(None);
        }

        state.connection = next;
        state.status_changed_at = Utc::now();

        let event = match (prev, next) {
            (ConnectionStatus::Offline, ConnectionStatus::Online) => {
                Some(CameraStatusEvent::Recovered)
            }
            (_, ConnectionStatus::Offline) => Some(CameraStatusEvent::Lost),
            _ => None,
        };

        match event {
            Some(CameraStatusEvent::Lost) => tracing::warn!(
                camera_id = %camera_id,
                line_id = %state.identity.line_id,
                error = state.last_error.as_deref().unwrap_or("-"),
                "Camera lost"
            ),
            Some(CameraStatusEvent::Recovered) => tracing::info!(
                camera_id = %camera_id,
                line_id = %state.identity.line_id,
                reconnects = state.reconnects,
                "Camera recovered"
            ),
            None => {}
        }
        Ok(event)
    }

    pub async fn record_frame(
        &self,
        camera_id: &str,
        at: DateTime<Utc>,
        counters: CaptureCounters,
    ) {
        if let Some(state) = self.cameras.write().await.get_mut(camera_id) {
            state.last_frame_at = Some(at);
            state.counters = counters;
        }
    }

    pub async fn record_reconnect(&self, camera_id: &str) {
        if let Some(state) = self.cameras.write().await.get_mut(camera_id) {
            state.reconnects += 1;
        }
    }

    pub async fn get(&self, camera_id: &str) -> Option<CameraState> {
        self.cameras.read().await.get(camera_id).cloned()
    }

    /// All cameras, sorted by id
    pub async fn snapshot(&self) -> Vec<CameraState> {
        let mut all: Vec<CameraState> = self.cameras.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.identity.camera_id.cmp(&b.identity.camera_id));
        all
    }

    pub async fn by_line(&self, line_id: &str) -> Vec<CameraState> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|c| c.identity.line_id == line_id)
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        self.cameras
            .read()
            .await
            .values()
            .filter(|c| c.connection == ConnectionStatus::Online)
            .count()
    }
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self::new()
    }
}
