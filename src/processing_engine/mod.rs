//! ProcessingEngine - claims batches and turns them into detection records
//!
//! ## Responsibilities
//!
//! - Poll loop: stale reclaim, then claim pending batches per line
//! - Fan frames out to a bounded worker pool (embed + nearest match)
//! - Aggregate per-employee counts/confidence, write one DetectionRecord
//! - Complete the batch and delete its frames, or mark it `error` and
//!   quarantine it
//! - Circuit breaker around each batch; back off when the store is down
//!
//! ## Shutdown
//!
//! `stop()` only interrupts the sleep between cycles. A batch already in
//! progress runs to completion; batches claimed but not yet started are
//! released back to `pending`.

mod aggregator;

pub use aggregator::{AggregateSummary, DetectionAggregator, FrameOutcome};

use crate::batch_manager::parse_window_label;
use crate::batch_store::{Batch, BatchStatus, BatchStore};
use crate::circuit_breaker::{BreakerState, CallPermit, CircuitBreaker};
use crate::config_store::AppConfig;
use crate::detection_log_service::{
    CycleMetrics, DetectionLogService, DetectionRecord, InsertOutcome,
};
use crate::employee_registry::EmployeeRegistry;
use crate::error::{Error, Result};
use crate::face_client::FaceEmbedder;
use crate::quarantine::QuarantineHandler;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const MISSING_STORAGE: &str = "storage location missing";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lines: Vec<String>,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub claim_batch_size: u32,
    pub lock_timeout: Duration,
    pub min_images_per_batch: usize,
    pub max_workers: usize,
    pub tolerance: f64,
    /// 0 disables downscaling
    pub max_image_dimension: u32,
    pub delete_after_process: bool,
    pub max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.processing;
        Self {
            lines: config.line_ids(),
            poll_interval: Duration::from_secs(p.poll_interval_secs),
            poll_jitter: Duration::from_millis(p.poll_jitter_ms),
            claim_batch_size: p.claim_batch_size,
            lock_timeout: Duration::from_secs(p.lock_timeout_secs),
            min_images_per_batch: p.min_images_per_batch,
            max_workers: p.max_workers,
            tolerance: p.face_match_tolerance as f64,
            max_image_dimension: p.max_image_dimension,
            delete_after_process: config.storage.delete_after_process,
            max_backoff: Duration::from_secs(p.max_backoff_secs),
        }
    }
}

/// What one poll cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub stale_reclaimed: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub batches_released: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub stale_reclaimed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// How one claimed batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    Completed,
    Failed,
    /// Another processor owns it now (stale reclaim raced us)
    Lost,
    /// Handed back to pending for a later cycle
    Released,
}

pub struct ProcessingEngine {
    config: EngineConfig,
    store: Arc<BatchStore>,
    detection_log: Arc<DetectionLogService>,
    embedder: Arc<dyn FaceEmbedder>,
    registry: Arc<dyn EmployeeRegistry>,
    breaker: Arc<CircuitBreaker>,
    quarantine: QuarantineHandler,
    stats: RwLock<EngineStats>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: Arc<BatchStore>,
        detection_log: Arc<DetectionLogService>,
        embedder: Arc<dyn FaceEmbedder>,
        registry: Arc<dyn EmployeeRegistry>,
        breaker: Arc<CircuitBreaker>,
        quarantine: QuarantineHandler,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            detection_log,
            embedder,
            registry,
            breaker,
            quarantine,
            stats: RwLock::new(EngineStats::default()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Start the poll loop
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::warn!("Processing engine already running");
            return;
        }
        self.shutdown.send_replace(false);

        tracing::info!(
            processor_id = %self.store.processor(),
            lines = ?self.config.lines,
            max_workers = self.config.max_workers,
            "Starting processing engine"
        );

        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let delay = match engine.run_cycle().await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        if report.claimed > 0 || report.stale_reclaimed > 0 {
                            tracing::info!(
                                claimed = report.claimed,
                                completed = report.completed,
                                failed = report.failed,
                                released = report.released,
                                stale_reclaimed = report.stale_reclaimed,
                                "Processing cycle finished"
                            );
                        }
                        engine.next_poll_delay()
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        engine.stats.write().await.failed_cycles += 1;
                        let delay = backoff_delay(
                            engine.config.poll_interval,
                            consecutive_failures,
                            engine.config.max_backoff,
                        );
                        tracing::error!(
                            error = %e,
                            consecutive_failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "Processing cycle failed"
                        );
                        delay
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }

            tracing::info!("Processing engine stopped");
        }));
    }

    /// Stop the poll loop, letting an in-flight batch finish
    pub async fn stop(&self) {
        tracing::info!("Stopping processing engine");
        self.shutdown.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Processing engine task ended abnormally");
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One poll cycle over every configured line
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        report.stale_reclaimed = self.store.stale_reclaim(self.config.lock_timeout).await?;
        if report.stale_reclaimed > 0 {
            tracing::warn!(count = report.stale_reclaimed, "Reclaimed stale batches");
        }

        for line_id in &self.config.lines {
            if self.stopping() {
                break;
            }
            if self.breaker.state() == BreakerState::Open {
                tracing::debug!(line_id = %line_id, "Circuit open, not claiming");
                break;
            }

            let claimed = self
                .store
                .claim_pending(line_id, self.config.claim_batch_size)
                .await?;
            report.claimed += claimed.len() as u64;
            if !claimed.is_empty() {
                tracing::info!(line_id = %line_id, count = claimed.len(), "Claimed batches");
            }

            let mut queue = claimed.into_iter();
            while let Some(batch) = queue.next() {
                if self.stopping() {
                    let rest = std::iter::once(batch).chain(queue.by_ref());
                    report.released += self.release_all(rest).await;
                    break;
                }

                let permit = match self.breaker.try_acquire() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(
                            line_id = %line_id,
                            "Circuit opened mid-cycle, releasing claimed batches"
                        );
                        let rest = std::iter::once(batch).chain(queue.by_ref());
                        report.released += self.release_all(rest).await;
                        break;
                    }
                };

                match self.handle_batch(&batch, permit).await {
                    Ok(BatchEnd::Completed) => report.completed += 1,
                    Ok(BatchEnd::Failed) => report.failed += 1,
                    Ok(BatchEnd::Lost) => {}
                    Ok(BatchEnd::Released) => report.released += 1,
                    Err(e) => {
                        // store trouble: hand back what we have not touched
                        self.release_all(queue.by_ref()).await;
                        self.record_cycle(&report, started).await;
                        return Err(e);
                    }
                }
            }
        }

        self.record_cycle(&report, started).await;
        Ok(report)
    }

    async fn record_cycle(&self, report: &CycleReport, started: Instant) {
        let now = Utc::now();
        {
            let mut stats = self.stats.write().await;
            stats.cycles += 1;
            stats.batches_completed += report.completed;
            stats.batches_failed += report.failed;
            stats.batches_released += report.released;
            stats.stale_reclaimed += report.stale_reclaimed;
            stats.last_cycle_at = Some(now);
        }

        // idle polls are not persisted
        if report.claimed == 0 && report.stale_reclaimed == 0 {
            return;
        }
        let metrics = CycleMetrics {
            processor_id: self.store.processor().id().to_string(),
            recorded_at: now,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stale_reclaimed: report.stale_reclaimed,
            claimed: report.claimed,
            completed: report.completed,
            failed: report.failed,
            released: report.released,
        };
        if let Err(e) = self.detection_log.record_cycle(&metrics).await {
            tracing::warn!(error = %e, "Cycle metrics not saved");
        }
    }

    async fn release_all(&self, batches: impl Iterator<Item = Batch>) -> u64 {
        let mut released = 0;
        for batch in batches {
            match self.store.release_claim(&batch.location).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        location = %batch.location,
                        error = %e,
                        "Release failed, left for stale reclaim"
                    );
                }
            }
        }
        released
    }

    /// Drive one claimed batch to a terminal state. Only store errors are
    /// returned; processing failures end as `BatchEnd::Failed`.
    async fn handle_batch(&self, batch: &Batch, permit: CallPermit<'_>) -> Result<BatchEnd> {
        let dir = PathBuf::from(&batch.location);

        match tokio::fs::try_exists(&dir).await {
            Ok(true) => {}
            Ok(false) => {
                drop(permit);
                tracing::error!(
                    line_id = %batch.line_id,
                    location = %batch.location,
                    "Batch storage missing"
                );
                return self.fail_batch(batch, MISSING_STORAGE, false).await;
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(
                    line_id = %batch.line_id,
                    location = %batch.location,
                    error = %e,
                    "Batch storage unreadable, releasing for a later cycle"
                );
                return if self.store.release_claim(&batch.location).await? {
                    Ok(BatchEnd::Released)
                } else {
                    Ok(BatchEnd::Lost)
                };
            }
        }

        match self.process_batch(batch, &dir).await {
            Ok(record) => {
                permit.success();
                self.complete_batch(batch, &record, &dir).await
            }
            Err(e) => {
                permit.failure();
                let message = e.to_string();
                tracing::error!(
                    line_id = %batch.line_id,
                    location = %batch.location,
                    error = %message,
                    "Batch processing failed"
                );
                self.fail_batch(batch, &message, true).await
            }
        }
    }

    async fn complete_batch(
        &self,
        batch: &Batch,
        record: &DetectionRecord,
        dir: &Path,
    ) -> Result<BatchEnd> {
        if self.detection_log.insert(record).await? == InsertOutcome::AlreadyRecorded {
            tracing::warn!(
                location = %batch.location,
                "Detection record already present, keeping the first"
            );
        }

        match self.store.set_status(&batch.location, BatchStatus::Completed, None).await {
            Ok(()) => {}
            Err(Error::InvalidTransition(reason)) | Err(Error::NotFound(reason)) => {
                tracing::warn!(
                    location = %batch.location,
                    reason = %reason,
                    "Lost batch ownership, frames left in place"
                );
                return Ok(BatchEnd::Lost);
            }
            Err(e) => return Err(e),
        }

        if self.config.delete_after_process {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                tracing::warn!(
                    location = %batch.location,
                    error = %e,
                    "Failed to delete processed frames"
                );
            }
        }

        tracing::info!(
            line_id = %batch.line_id,
            location = %batch.location,
            total_images = record.total_images,
            faces_detected = record.total_faces_detected,
            faces_recognized = record.total_faces_recognized,
            employees = record.unique_people_recognized,
            elapsed_secs = record.processing_time_seconds,
            "Batch completed"
        );
        Ok(BatchEnd::Completed)
    }

    async fn fail_batch(&self, batch: &Batch, message: &str, quarantine: bool) -> Result<BatchEnd> {
        match self.store.set_status(&batch.location, BatchStatus::Error, Some(message)).await {
            Ok(()) => {}
            Err(Error::InvalidTransition(reason)) | Err(Error::NotFound(reason)) => {
                tracing::warn!(
                    location = %batch.location,
                    reason = %reason,
                    "Lost batch ownership before marking error"
                );
                return Ok(BatchEnd::Lost);
            }
            Err(e) => return Err(e),
        }

        if quarantine {
            self.quarantine
                .quarantine(&batch.line_id, &batch.location, message)
                .await;
        }
        Ok(BatchEnd::Failed)
    }

    /// Embed and match every frame of the batch. Per-frame failures are
    /// skipped; the batch fails only if no frame could be processed.
    async fn process_batch(&self, batch: &Batch, dir: &Path) -> Result<DetectionRecord> {
        let started = Instant::now();
        let frames = list_frames(dir).await?;

        if frames.len() < self.config.min_images_per_batch {
            tracing::warn!(
                location = %batch.location,
                frames = frames.len(),
                min_images = self.config.min_images_per_batch,
                "Batch below minimum frame count, results are low-confidence"
            );
        }

        let aggregator = Arc::new(DetectionAggregator::new());
        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for path in &frames {
            let permit = workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let path = path.clone();
            let embedder = self.embedder.clone();
            let registry = self.registry.clone();
            let aggregator = aggregator.clone();
            let tolerance = self.config.tolerance;
            let max_dimension = self.config.max_image_dimension;

            tasks.spawn(async move {
                let _permit = permit;
                let analyzed = analyze_frame(
                    &path,
                    embedder.as_ref(),
                    registry.as_ref(),
                    tolerance,
                    max_dimension,
                )
                .await;
                match analyzed {
                    Ok(outcome) => aggregator.add_frame(&outcome),
                    Err(e) => {
                        tracing::warn!(frame = %path.display(), error = %e, "Frame skipped");
                        aggregator.add_failure();
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Frame worker panicked");
                aggregator.add_failure();
            }
        }

        let summary = aggregator.summary();
        {
            let mut stats = self.stats.write().await;
            stats.frames_processed += summary.frames_processed;
            stats.frames_failed += summary.frames_failed;
        }
        if summary.all_frames_failed() {
            return Err(Error::Embedding(format!(
                "all {} frames failed to process",
                summary.frames_failed
            )));
        }

        let captured_at = dir
            .file_name()
            .and_then(|n| parse_window_label(&n.to_string_lossy()))
            .unwrap_or(batch.created_at);

        Ok(DetectionRecord {
            line_id: batch.line_id.clone(),
            batch_location: batch.location.clone(),
            processor_id: self.store.processor().id().to_string(),
            capture_type: capture_type(&frames).to_string(),
            captured_at,
            processed_at: Utc::now(),
            total_images: frames.len() as u64,
            processing_time_seconds: started.elapsed().as_secs_f64(),
            total_faces_detected: summary.faces_detected,
            total_faces_recognized: summary.faces_recognized,
            total_faces_unknown: summary.faces_unknown,
            unique_people_recognized: summary.detections.len() as u64,
            detections: summary.detections,
        })
    }

    fn next_poll_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }
}

/// Exponential backoff after consecutive failed cycles, capped
pub fn backoff_delay(base: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.max(Duration::from_secs(1))
        .saturating_mul(1u32 << exponent)
        .min(max)
}

async fn analyze_frame(
    path: &Path,
    embedder: &dyn FaceEmbedder,
    registry: &dyn EmployeeRegistry,
    tolerance: f64,
    max_dimension: u32,
) -> Result<FrameOutcome> {
    let bytes = tokio::fs::read(path).await?;
    let bytes = tokio::task::spawn_blocking(move || prepare_image(bytes, max_dimension))
        .await
        .map_err(|e| Error::Internal(format!("image task failed: {}", e)))??;

    let faces = embedder.embed(&bytes).await?;
    let mut matches = Vec::new();
    for face in &faces {
        if let Some(found) = registry.nearest(&face.vector, tolerance).await? {
            matches.push(found);
        }
    }

    Ok(FrameOutcome {
        faces_detected: faces.len() as u64,
        matches,
    })
}

/// Downscale images whose longer side exceeds `max_dimension`, keeping
/// the aspect ratio. Smaller images pass through untouched.
pub fn prepare_image(bytes: Vec<u8>, max_dimension: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(&bytes)?;
    if max_dimension == 0 || (img.width() <= max_dimension && img.height() <= max_dimension) {
        return Ok(bytes);
    }

    let resized = img.resize(max_dimension, max_dimension, FilterType::Triangle).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90).encode_image(&resized)?;
    Ok(out)
}

/// Frame files of a batch directory, sorted by name
async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_frame = path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                FRAME_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false);
        if is_frame && entry.file_type().await?.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// `motion` if any frame carries the motion tag
fn capture_type(frames: &[PathBuf]) -> &'static str {
    let motion = frames.iter().any(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().contains("_motion"))
            .unwrap_or(false)
    });
    if motion {
        "motion"
    } else {
        "interval"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90).encode_image(&img).unwrap();
        out
    }

    #[test]
    fn test_prepare_image_downscales_keeping_aspect() {
        let out = prepare_image(jpeg(1600, 900), 800).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.width(), 800);
        assert_eq!(img.height(), 450);
    }

    #[test]
    fn test_prepare_image_passthrough() {
        let small = jpeg(640, 480);
        assert_eq!(prepare_image(small.clone(), 800).unwrap(), small);
        let big = jpeg(1000, 100);
        assert_eq!(prepare_image(big.clone(), 0).unwrap(), big);
        assert!(prepare_image(b"not an image".to_vec(), 800).is_err());
    }

    #[test]
    fn test_capture_type() {
        let interval = vec![PathBuf::from("/f/L1/x/front_frame_120000_000_0001.jpg")];
        assert_eq!(capture_type(&interval), "interval");
        let motion = vec![
            PathBuf::from("/f/L1/x/front_frame_120000_000_0001.jpg"),
            PathBuf::from("/f/L1/x/front_motion24000_120001_000_0002.jpg"),
        ];
        assert_eq!(capture_type(&motion), "motion");
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(120);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(40));
        assert_eq!(backoff_delay(base, 10, max), max);
        assert_eq!(backoff_delay(base, u32::MAX, max), max);
    }

    #[tokio::test]
    async fn test_list_frames_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b_0002.jpg", "a_0001.JPEG", "c.png", "notes.txt"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(tmp.path().join("sub.jpg")).unwrap();

        let frames = list_frames(tmp.path()).await.unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_0001.JPEG", "b_0002.jpg", "c.png"]);
    }
}
