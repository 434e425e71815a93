//! BatchDirectoryManager - per-line, time-windowed batch directories
//!
//! ## Responsibilities
//!
//! - Keep the current bucket (window key, directory, frame count) per line
//! - Write accepted frames into the current bucket's directory
//! - On window rollover, register the finished bucket with the BatchStore
//!   (only if it holds at least one frame) and open the next one
//! - Retry registrations that failed (store outage) on the next tick
//!
//! ## Locking
//!
//! One mutex per line, never a global one: every read/mutate of a line's
//! bucket (frame counter, rollover decision, registration) happens under
//! that line's lock.

use crate::batch_store::BatchStore;
use crate::error::{Error, Result};
use crate::frame_source::Frame;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use image::codecs::jpeg::JpegEncoder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};

const LABEL_MINUTES: &str = "%Y%m%d_%H%M";
const LABEL_SECONDS: &str = "%Y%m%d_%H%M%S";

/// Why a frame was captured
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameTag {
    Interval,
    /// Burst frame, tagged with the area that triggered it
    Motion { area: f64 },
}

/// A frame on its way from a camera task to its line's bucket
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub line_id: String,
    pub camera_id: String,
    pub position: String,
    pub frame: Frame,
    pub tag: FrameTag,
}

/// Start of a batch window plus its directory label
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowKey {
    start: DateTime<Utc>,
    label: String,
}

impl WindowKey {
    pub fn for_time(at: DateTime<Utc>, window_secs: u64) -> Self {
        let window = window_secs.max(1) as i64;
        let start_secs = at.timestamp().div_euclid(window) * window;
        let start = Utc.timestamp_opt(start_secs, 0).single().unwrap_or(at);
        let format = if window % 60 == 0 {
            LABEL_MINUTES
        } else {
            LABEL_SECONDS
        };
        Self {
            start,
            label: start.format(format).to_string(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Window start encoded in a batch directory name, if it is one
pub fn parse_window_label(dir_name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(dir_name, LABEL_SECONDS)
        .or_else(|_| NaiveDateTime::parse_from_str(&format!("{}00", dir_name), LABEL_SECONDS))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone)]
pub struct BatchManagerConfig {
    pub frames_dir: PathBuf,
    pub window_secs: u64,
    pub jpeg_quality: u8,
    /// Concurrent JPEG encodes across all lines
    pub encode_workers: usize,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        Self {
            frames_dir: PathBuf::from("frames"),
            window_secs: 60,
            jpeg_quality: 90,
            encode_workers: 4,
        }
    }
}

#[derive(Debug)]
struct LineBucket {
    window: WindowKey,
    dir: PathBuf,
    frame_count: u64,
    opened_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LineState {
    current: Option<LineBucket>,
    /// Finished buckets whose registration failed, oldest first
    unregistered: Vec<PathBuf>,
    /// Latest window handed to the store; its directory is never reopened
    last_closed: Option<WindowKey>,
}

/// Summary of the current bucket of a line
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo {
    pub window_label: String,
    pub dir: PathBuf,
    pub frame_count: u64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    frames_written: AtomicU64,
    batches_registered: AtomicU64,
    registration_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub frames_written: u64,
    pub batches_registered: u64,
    pub registration_failures: u64,
}

pub struct BatchDirectoryManager {
    config: BatchManagerConfig,
    store: Arc<BatchStore>,
    lines: RwLock<HashMap<String, Arc<Mutex<LineState>>>>,
    encode_permits: Semaphore,
    counters: Counters,
}

impl BatchDirectoryManager {
    pub fn new(config: BatchManagerConfig, store: Arc<BatchStore>) -> Self {
        let permits = config.encode_workers.max(1);
        Self {
            config,
            store,
            lines: RwLock::new(HashMap::new()),
            encode_permits: Semaphore::new(permits),
            counters: Counters::default(),
        }
    }

    /// Write one frame into its line's current bucket, rolling the bucket
    /// over first if the frame belongs to a later window. Frames from an
    /// earlier window (late arrivals) join the current bucket; with no open
    /// bucket they go to the wall-clock window, never into a closed one.
    pub async fn accept_frame(&self, captured: CapturedFrame) -> Result<PathBuf> {
        let line_lock = self.get_or_create_line(&captured.line_id).await;
        let mut state = line_lock.lock().await;

        let mut window = WindowKey::for_time(captured.frame.captured_at(), self.config.window_secs);

        let roll = match &state.current {
            Some(bucket) => window > bucket.window,
            None => false,
        };
        if roll {
            if let Some(previous) = state.current.take() {
                self.finalize(&captured.line_id, previous, &mut state).await;
            }
        }
        if !state.unregistered.is_empty() {
            self.retry_unregistered(&captured.line_id, &mut state).await;
        }

        if state.current.is_none() {
            if let Some(closed) = state.last_closed.as_ref().filter(|closed| window <= **closed) {
                let now = WindowKey::for_time(Utc::now(), self.config.window_secs);
                if now <= *closed {
                    tracing::warn!(
                        line_id = %captured.line_id,
                        window = %window.label(),
                        closed = %closed.label(),
                        "Frame for a closed window dropped"
                    );
                    return Err(Error::Validation(format!(
                        "window {} of line {} is already closed",
                        window.label(),
                        captured.line_id
                    )));
                }
                tracing::debug!(
                    line_id = %captured.line_id,
                    window = %window.label(),
                    target = %now.label(),
                    "Late frame for a closed window rerouted"
                );
                window = now;
            }
            state.current = Some(self.open_bucket(&captured.line_id, window).await?);
        }
        let bucket = state
            .current
            .as_mut()
            .ok_or_else(|| Error::Internal("bucket missing after open".into()))?;

        let sequence = bucket.frame_count + 1;
        let path = bucket.dir.join(frame_file_name(&captured, sequence));
        let bytes = self.encode_jpeg(&captured.frame).await?;
        tokio::fs::write(&path, bytes).await?;

        bucket.frame_count = sequence;
        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            line_id = %captured.line_id,
            camera_id = %captured.camera_id,
            path = %path.display(),
            frame_count = bucket.frame_count,
            "Frame written"
        );
        Ok(path)
    }

    /// Finalize every line whose current window ended before `now`.
    /// Returns the locations registered.
    pub async fn roll_over_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let window = WindowKey::for_time(now, self.config.window_secs);
        let mut registered = Vec::new();

        for (line_id, line_lock) in self.line_locks().await {
            let mut state = line_lock.lock().await;
            let expired = state
                .current
                .as_ref()
                .map_or(false, |bucket| bucket.window < window);
            if expired {
                if let Some(bucket) = state.current.take() {
                    if let Some(location) = self.finalize(&line_id, bucket, &mut state).await {
                        registered.push(location);
                    }
                }
            }
            if !state.unregistered.is_empty() {
                registered.extend(self.retry_unregistered(&line_id, &mut state).await);
            }
        }
        registered
    }

    /// Finalize all open buckets regardless of window (shutdown)
    pub async fn finalize_all(&self) -> Vec<String> {
        let mut registered = Vec::new();
        for (line_id, line_lock) in self.line_locks().await {
            let mut state = line_lock.lock().await;
            if let Some(bucket) = state.current.take() {
                if let Some(location) = self.finalize(&line_id, bucket, &mut state).await {
                    registered.push(location);
                }
            }
            if !state.unregistered.is_empty() {
                registered.extend(self.retry_unregistered(&line_id, &mut state).await);
            }
        }
        registered
    }

    pub async fn current_bucket(&self, line_id: &str) -> Option<BucketInfo> {
        let line_lock = self.lines.read().await.get(line_id).cloned()?;
        let state = line_lock.lock().await;
        state.current.as_ref().map(|b| BucketInfo {
            window_label: b.window.label().to_string(),
            dir: b.dir.clone(),
            frame_count: b.frame_count,
            opened_at: b.opened_at,
        })
    }

    pub async fn pending_registrations(&self, line_id: &str) -> usize {
        match self.lines.read().await.get(line_id).cloned() {
            Some(line_lock) => line_lock.lock().await.unregistered.len(),
            None => 0,
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            batches_registered: self.counters.batches_registered.load(Ordering::Relaxed),
            registration_failures: self.counters.registration_failures.load(Ordering::Relaxed),
        }
    }

    async fn open_bucket(&self, line_id: &str, window: WindowKey) -> Result<LineBucket> {
        let dir = self.config.frames_dir.join(line_id).join(window.label());
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(
            line_id = %line_id,
            window = %window.label(),
            dir = %dir.display(),
            "Batch bucket opened"
        );
        Ok(LineBucket {
            window,
            dir,
            frame_count: 0,
            opened_at: Utc::now(),
        })
    }

    /// Register a finished bucket. Empty buckets are removed instead.
    async fn finalize(
        &self,
        line_id: &str,
        bucket: LineBucket,
        state: &mut LineState,
    ) -> Option<String> {
        if bucket.frame_count == 0 {
            let _ = tokio::fs::remove_dir(&bucket.dir).await;
            return None;
        }

        if state.last_closed.as_ref().map_or(true, |closed| bucket.window > *closed) {
            state.last_closed = Some(bucket.window.clone());
        }
        tracing::info!(
            line_id = %line_id,
            window = %bucket.window.label(),
            frame_count = bucket.frame_count,
            "Batch window closed"
        );
        if self.register(line_id, &bucket.dir).await {
            Some(location_of(&bucket.dir))
        } else {
            state.unregistered.push(bucket.dir);
            None
        }
    }

    async fn retry_unregistered(&self, line_id: &str, state: &mut LineState) -> Vec<String> {
        let mut registered = Vec::new();
        let mut still_pending = Vec::new();
        for dir in std::mem::take(&mut state.unregistered) {
            if self.register(line_id, &dir).await {
                registered.push(location_of(&dir));
            } else {
                still_pending.push(dir);
            }
        }
        state.unregistered = still_pending;
        registered
    }

    /// True once the store holds the batch (a conflict means it already does)
    async fn register(&self, line_id: &str, dir: &Path) -> bool {
        let location = location_of(dir);
        match self.store.register_batch(line_id, &location).await {
            Ok(_) => {
                self.counters.batches_registered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(Error::Conflict(_)) => {
                tracing::warn!(
                    line_id = %line_id,
                    location = %location,
                    "Batch was already registered"
                );
                true
            }
            Err(e) => {
                self.counters.registration_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    line_id = %line_id,
                    location = %location,
                    error = %e,
                    "Batch registration failed, will retry"
                );
                false
            }
        }
    }

    async fn encode_jpeg(&self, frame: &Frame) -> Result<Vec<u8>> {
        let _permit = self
            .encode_permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        let frame = frame.clone();
        let quality = self.config.jpeg_quality.clamp(1, 100);

        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            JpegEncoder::new_with_quality(&mut buf, quality).encode_image(frame.image())?;
            Ok(buf)
        })
        .await
        .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))?
    }

    async fn get_or_create_line(&self, line_id: &str) -> Arc<Mutex<LineState>> {
        {
            let lines = self.lines.read().await;
            if let Some(line) = lines.get(line_id) {
                return line.clone();
            }
        }

        let mut lines = self.lines.write().await;
        lines
            .entry(line_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LineState::default())))
            .clone()
    }

    async fn line_locks(&self) -> Vec<(String, Arc<Mutex<LineState>>)> {
        let mut all: Vec<_> = self
            .lines
            .read()
            .await
            .iter()
            .map(|(id, lock)| (id.clone(), lock.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

fn location_of(dir: &Path) -> String {
    dir.to_string_lossy().into_owned()
}

/// `{position}_{tag}_{HHMMSS_mmm}_{seq}.jpg`
fn frame_file_name(captured: &CapturedFrame, sequence: u64) -> String {
    let position: String = captured
        .position
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let tag = match captured.tag {
        FrameTag::Interval => "frame".to_string(),
        FrameTag::Motion { area } => format!("motion{:.0}", area),
    };
    format!(
        "{}_{}_{}_{:04}.jpg",
        position,
        tag,
        captured.frame.captured_at().format("%H%M%S_%3f"),
        sequence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_store::BatchStatus;
    use crate::db::Database;
    use crate::processor::ProcessorInstance;
    use image::{Rgb, RgbImage};

    fn at(secs: i64) -> DateTime<Utc> {
        // 2024-01-01 12:00:00 UTC
        Utc.timestamp_opt(1_704_110_400 + secs, 0).single().unwrap()
    }

    fn captured(line: &str, secs: i64, shade: u8, tag: FrameTag) -> CapturedFrame {
        let image = RgbImage::from_fn(16, 16, |x, y| Rgb([shade, (x * 8) as u8, (y * 8) as u8]));
        CapturedFrame {
            line_id: line.to_string(),
            camera_id: format!("{}_usb_0", line),
            position: "front cam".to_string(),
            frame: Frame::new(image, at(secs)),
            tag,
        }
    }

    async fn manager(dir: &Path) -> (Arc<BatchStore>, Arc<BatchDirectoryManager>) {
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(BatchStore::new(&db, ProcessorInstance::generate()));
        let config = BatchManagerConfig {
            frames_dir: dir.to_path_buf(),
            ..Default::default()
        };
        (store.clone(), Arc::new(BatchDirectoryManager::new(config, store)))
    }

    #[test]
    fn test_window_key() {
        let key = WindowKey::for_time(at(59), 60);
        assert_eq!(key.label(), "20240101_1200");
        assert_eq!(key.start(), at(0));
        assert!(WindowKey::for_time(at(60), 60) > key);

        let fine = WindowKey::for_time(at(17), 10);
        assert_eq!(fine.label(), "20240101_120010");
    }

    #[test]
    fn test_parse_window_label() {
        assert_eq!(parse_window_label("20240101_1200"), Some(at(0)));
        assert_eq!(parse_window_label("20240101_120010"), Some(at(10)));
        assert_eq!(parse_window_label("not-a-window"), None);
    }

    #[test]
    fn test_frame_file_name() {
        let name = frame_file_name(&captured("L1", 5, 1, FrameTag::Motion { area: 23456.7 }), 3);
        assert_eq!(name, "front-cam_motion23457_120005_000_0003.jpg");
    }

    #[tokio::test]
    async fn test_single_registration_per_window() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        for i in 0..7 {
            manager
                .accept_frame(captured("L1", i * 5, i as u8, FrameTag::Interval))
                .await
                .unwrap();
        }
        let bucket = manager.current_bucket("L1").await.unwrap();
        assert_eq!(bucket.frame_count, 7);
        assert_eq!(bucket.window_label, "20240101_1200");
        assert!(store.list("L1", BatchStatus::Pending, 10).await.unwrap().is_empty());

        // first frame of the next window closes the previous one
        manager
            .accept_frame(captured("L1", 61, 99, FrameTag::Interval))
            .await
            .unwrap();
        let pending = store.list("L1", BatchStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].location.ends_with("20240101_1200"));

        let files = std::fs::read_dir(&pending[0].location).unwrap().count();
        assert_eq!(files, 7);
        assert_eq!(manager.current_bucket("L1").await.unwrap().frame_count, 1);
        assert_eq!(manager.stats().batches_registered, 1);
    }

    #[tokio::test]
    async fn test_lines_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        manager.accept_frame(captured("L1", 1, 1, FrameTag::Interval)).await.unwrap();
        manager.accept_frame(captured("L2", 2, 2, FrameTag::Interval)).await.unwrap();
        manager.accept_frame(captured("L1", 65, 3, FrameTag::Interval)).await.unwrap();

        assert_eq!(store.list("L1", BatchStatus::Pending, 10).await.unwrap().len(), 1);
        assert!(store.list("L2", BatchStatus::Pending, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_frame_joins_current_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        manager.accept_frame(captured("L1", 61, 1, FrameTag::Interval)).await.unwrap();
        manager.accept_frame(captured("L1", 30, 2, FrameTag::Interval)).await.unwrap();

        assert_eq!(manager.current_bucket("L1").await.unwrap().frame_count, 2);
        assert!(store.list("L1", BatchStatus::Pending, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_rollover_and_finalize_all() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        manager.accept_frame(captured("L1", 10, 1, FrameTag::Interval)).await.unwrap();
        manager.accept_frame(captured("L2", 10, 2, FrameTag::Interval)).await.unwrap();

        // same window: nothing to do
        assert!(manager.roll_over_idle(at(40)).await.is_empty());

        let registered = manager.roll_over_idle(at(75)).await;
        assert_eq!(registered.len(), 2);
        assert!(manager.current_bucket("L1").await.is_none());

        manager.accept_frame(captured("L1", 80, 3, FrameTag::Interval)).await.unwrap();
        let registered = manager.finalize_all().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(store.list("L1", BatchStatus::Pending, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_late_frame_never_reopens_registered_window() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        manager.accept_frame(captured("L1", 5, 1, FrameTag::Interval)).await.unwrap();
        manager.accept_frame(captured("L1", 20, 2, FrameTag::Interval)).await.unwrap();
        let registered = manager.roll_over_idle(at(70)).await;
        assert_eq!(registered.len(), 1);
        let registered_dir = PathBuf::from(&registered[0]);
        assert_eq!(std::fs::read_dir(&registered_dir).unwrap().count(), 2);

        // arrives after the idle rollover, stamped inside the closed window
        let path = manager
            .accept_frame(captured("L1", 45, 3, FrameTag::Interval))
            .await
            .unwrap();

        assert!(!path.starts_with(&registered_dir));
        assert_eq!(std::fs::read_dir(&registered_dir).unwrap().count(), 2);
        let bucket = manager.current_bucket("L1").await.unwrap();
        assert_ne!(bucket.window_label, "20240101_1200");
        assert_eq!(bucket.frame_count, 1);
        assert_eq!(store.list("L1", BatchStatus::Pending, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cameras_share_one_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, manager) = manager(tmp.path()).await;

        let mut tasks = Vec::new();
        for cam in 0..4u8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..5u8 {
                    let mut frame =
                        captured("L1", (i as i64) * 2, cam * 10 + i, FrameTag::Interval);
                    frame.position = format!("cam{}", cam);
                    manager.accept_frame(frame).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(manager.current_bucket("L1").await.unwrap().frame_count, 20);
        manager.finalize_all().await;
        let pending = store.list("L1", BatchStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(std::fs::read_dir(&pending[0].location).unwrap().count(), 20);
    }
}
