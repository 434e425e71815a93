//! CaptureService - per-camera capture tasks feeding the batch manager
//!
//! ## Responsibilities
//!
//! - Build a source and an `AsyncFrameBuffer` per configured camera
//! - Interval mode: take the freshest frame every `interval_secs`
//! - Motion mode: compare consecutive frames, capture a tagged burst on motion
//! - Discard corrupt (and optionally blurry) frames before they are written
//! - One frame channel and sink task per line; frames of a line reach the
//!   `BatchDirectoryManager` in arrival order
//! - 1s ticker closing idle windows; `stop()` finalizes open buckets
//!
//! ## Shutdown
//!
//! Camera tasks are joined with a bounded timeout and aborted past it.
//! Frame buffers always release their sources.

use crate::batch_manager::{BatchDirectoryManager, CapturedFrame, FrameTag};
use crate::camera_registry::{CameraIdentity, CameraRegistry};
use crate::circuit_breaker::CircuitBreaker;
use crate::config_store::{AppConfig, BreakerConfig, CaptureConfig, CaptureMode};
use crate::frame_buffer::{AsyncFrameBuffer, BufferConfig};
use crate::frame_source::{build_source, redact_url, Frame, FrameSource};
use crate::frame_validator::FrameValidator;
use crate::motion_detector::{MotionDetector, MotionDetectorConfig, MotionResult};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const LINE_CHANNEL_CAPACITY: usize = 64;
const ROLLOVER_TICK: Duration = Duration::from_secs(1);

/// A camera ready to be started
pub struct CameraSetup {
    pub identity: CameraIdentity,
    pub source: Box<dyn FrameSource>,
    /// Overrides `capture.reconnect_delay_ms` for this camera
    pub reconnect_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Totals {
    frames_sent: AtomicU64,
    corrupt_discarded: AtomicU64,
    blurry_frames: AtomicU64,
    stale_skipped: AtomicU64,
    motion_events: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_sent: u64,
    pub corrupt_discarded: u64,
    /// Below `min_sharpness`; only discarded with `reject_blurry`
    pub blurry_frames: u64,
    /// Ticks with no new frame, or burst frames identical to the previous
    pub stale_skipped: u64,
    pub motion_events: u64,
}

struct Running {
    shutdown: watch::Sender<bool>,
    buffers: Vec<Arc<AsyncFrameBuffer>>,
    camera_tasks: Vec<(String, JoinHandle<()>)>,
    sink_tasks: Vec<(String, JoinHandle<()>)>,
    ticker: JoinHandle<()>,
}

pub struct CaptureService {
    capture: CaptureConfig,
    breaker: BreakerConfig,
    manager: Arc<BatchDirectoryManager>,
    registry: Arc<CameraRegistry>,
    validator: Arc<FrameValidator>,
    detector: Arc<MotionDetector>,
    motion_permits: Arc<Semaphore>,
    totals: Arc<Totals>,
    running: Mutex<Option<Running>>,
}

impl CaptureService {
    pub fn new(
        config: &AppConfig,
        manager: Arc<BatchDirectoryManager>,
        registry: Arc<CameraRegistry>,
    ) -> Self {
        Self {
            capture: config.capture.clone(),
            breaker: config.circuit_breaker.clone(),
            manager,
            registry,
            validator: Arc::new(FrameValidator::default()),
            detector: Arc::new(MotionDetector::new(MotionDetectorConfig::from(
                &config.capture.motion,
            ))),
            motion_permits: Arc::new(Semaphore::new(config.capture.motion.workers.max(1))),
            totals: Arc::new(Totals::default()),
            running: Mutex::new(None),
        }
    }

    /// Build sources for every configured camera and start capturing.
    /// A camera whose source cannot be built is registered offline and
    /// skipped; the others still start.
    pub async fn start(&self, config: &AppConfig) -> usize {
        let mut setups = Vec::new();

        for line in &config.lines {
            for (index, camera) in line.cameras.iter().enumerate() {
                let camera_id = camera.camera_id(&line.id, index);
                let identity = CameraIdentity {
                    camera_id: camera_id.clone(),
                    line_id: line.id.clone(),
                    kind: camera.kind,
                    target: camera_target(camera),
                    position: camera.position_or(&camera_id),
                };

                match build_source(&camera_id, camera, &config.capture.ffmpeg_path) {
                    Ok(source) => setups.push(CameraSetup {
                        identity,
                        source,
                        reconnect_delay: camera.reconnect_delay(),
                    }),
                    Err(e) => {
                        tracing::error!(
                            camera_id = %camera_id,
                            line_id = %line.id,
                            error = %e,
                            "Camera not started"
                        );
                        self.registry.register(identity).await;
                        let _ = self
                            .registry
                            .update_connection(&camera_id, false, Some(&e.to_string()))
                            .await;
                    }
                }
            }
        }

        self.start_with_sources(setups).await
    }

    /// Start capturing from already built sources. Returns the number of
    /// cameras started.
    pub async fn start_with_sources(&self, cameras: Vec<CameraSetup>) -> usize {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!("Capture already running");
            return 0;
        }

        let (shutdown, _) = watch::channel(false);
        let buffer_config = BufferConfig::from(&self.capture);

        let mut by_line: BTreeMap<String, Vec<CameraSetup>> = BTreeMap::new();
        for setup in cameras {
            by_line.entry(setup.identity.line_id.clone()).or_default().push(setup);
        }

        let mut buffers = Vec::new();
        let mut camera_tasks = Vec::new();
        let mut sink_tasks = Vec::new();

        for (line_id, setups) in by_line {
            let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
            let sink = tokio::spawn(run_sink(line_id.clone(), rx, self.manager.clone()));
            sink_tasks.push((line_id.clone(), sink));

            for setup in setups {
                let camera_id = setup.identity.camera_id.clone();
                self.registry.register(setup.identity.clone()).await;

                let breaker = Arc::new(CircuitBreaker::from_config(
                    format!("reconnect:{}", camera_id),
                    &self.breaker,
                ));
                let buffer = Arc::new(AsyncFrameBuffer::start(
                    setup.source,
                    buffer_config.clone().with_reconnect_delay(setup.reconnect_delay),
                    breaker,
                    self.registry.clone(),
                ));
                buffers.push(buffer.clone());

                let worker = CameraWorker {
                    identity: setup.identity,
                    buffer,
                    tx: tx.clone(),
                    capture: self.capture.clone(),
                    validator: self.validator.clone(),
                    detector: self.detector.clone(),
                    motion_permits: self.motion_permits.clone(),
                    totals: self.totals.clone(),
                    shutdown: shutdown.subscribe(),
                };
                camera_tasks.push((camera_id, tokio::spawn(worker.run())));
            }
        }

        let ticker = tokio::spawn(run_rollover_ticker(self.manager.clone(), shutdown.subscribe()));
        let started = camera_tasks.len();

        tracing::info!(
            cameras = started,
            lines = sink_tasks.len(),
            mode = self.capture.mode.as_str(),
            "Capture started"
        );

        *running = Some(Running {
            shutdown,
            buffers,
            camera_tasks,
            sink_tasks,
            ticker,
        });
        started
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Stop capturing, flush queued frames and finalize every open bucket
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        tracing::info!("Stopping capture");
        running.shutdown.send_replace(true);

        let timeout = Duration::from_millis(self.capture.stop_timeout_ms);
        join_all(
            running
                .camera_tasks
                .into_iter()
                .map(|(camera_id, task)| async move {
                    join_with_timeout(&camera_id, task, timeout).await
                }),
        )
        .await;
        join_all(running.buffers.iter().map(|buffer| buffer.stop())).await;
        // camera tasks held the senders, so the sinks drain and end
        for (line_id, task) in running.sink_tasks {
            join_with_timeout(&line_id, task, timeout).await;
        }
        join_with_timeout("rollover", running.ticker, timeout).await;

        let registered = self.manager.finalize_all().await;
        tracing::info!(registered = registered.len(), "Capture stopped");
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_sent: self.totals.frames_sent.load(Ordering::Relaxed),
            corrupt_discarded: self.totals.corrupt_discarded.load(Ordering::Relaxed),
            blurry_frames: self.totals.blurry_frames.load(Ordering::Relaxed),
            stale_skipped: self.totals.stale_skipped.load(Ordering::Relaxed),
            motion_events: self.totals.motion_events.load(Ordering::Relaxed),
        }
    }
}

fn camera_target(camera: &crate::config_store::CameraConfig) -> String {
    if let Some(url) = &camera.url {
        return redact_url(url);
    }
    if let Some(path) = &camera.path {
        return path.display().to_string();
    }
    camera
        .device
        .map(|d| format!("/dev/video{}", d))
        .unwrap_or_default()
}

async fn join_with_timeout(name: &str, mut task: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        task.abort();
        tracing::warn!(
            task = %name,
            timeout_ms = timeout.as_millis() as u64,
            "Task did not stop in time, aborted"
        );
    }
}

async fn run_sink(
    line_id: String,
    mut rx: mpsc::Receiver<CapturedFrame>,
    manager: Arc<BatchDirectoryManager>,
) {
    while let Some(frame) = rx.recv().await {
        let camera_id = frame.camera_id.clone();
        if let Err(e) = manager.accept_frame(frame).await {
            tracing::error!(
                line_id = %line_id,
                camera_id = %camera_id,
                error = %e,
                "Frame write failed"
            );
        }
    }
    tracing::debug!(line_id = %line_id, "Line sink closed");
}

async fn run_rollover_ticker(
    manager: Arc<BatchDirectoryManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(ROLLOVER_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.roll_over_idle(Utc::now()).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

struct CameraWorker {
    identity: CameraIdentity,
    buffer: Arc<AsyncFrameBuffer>,
    tx: mpsc::Sender<CapturedFrame>,
    capture: CaptureConfig,
    validator: Arc<FrameValidator>,
    detector: Arc<MotionDetector>,
    motion_permits: Arc<Semaphore>,
    totals: Arc<Totals>,
    shutdown: watch::Receiver<bool>,
}

impl CameraWorker {
    async fn run(mut self) {
        tracing::debug!(
            camera_id = %self.identity.camera_id,
            mode = self.capture.mode.as_str(),
            "Camera task started"
        );
        match self.capture.mode {
            CaptureMode::Interval => self.run_interval().await,
            CaptureMode::Motion => self.run_motion().await,
        }
        tracing::debug!(camera_id = %self.identity.camera_id, "Camera task stopped");
    }

    async fn run_interval(&mut self) {
        let period = Duration::from_secs_f64(self.capture.interval_secs.max(0.01));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => break,
            }

            let Some(frame) = self.latest_frame() else {
                self.totals.stale_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if !self.acceptable(&frame).await {
                continue;
            }
            if !self.send(frame, FrameTag::Interval).await {
                break;
            }
        }
    }

    async fn run_motion(&mut self) {
        let period = Duration::from_millis(self.capture.motion.check_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous: Option<Frame> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => break,
            }

            let Some(current) = self.latest_frame() else {
                continue;
            };
            if !self.acceptable(&current).await {
                continue;
            }
            let Some(before) = previous.replace(current.clone()) else {
                continue;
            };

            let Some(result) = self.compare(before, current.clone()).await else {
                continue;
            };
            if !result.motion {
                continue;
            }

            self.totals.motion_events.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                camera_id = %self.identity.camera_id,
                line_id = %self.identity.line_id,
                area = result.area,
                regions = result.regions.len(),
                "Motion detected"
            );

            match self.burst(current, result).await {
                Some(last) => previous = Some(last),
                None => break,
            }
        }
    }

    /// Send the triggering frame plus `burst_frames - 1` follow-ups, all
    /// tagged with the motion area. A follow-up identical to the frame
    /// before it is retried once after twice the burst interval. Returns
    /// the last frame seen, or `None` when capture is shutting down.
    async fn burst(&mut self, trigger: Frame, result: MotionResult) -> Option<Frame> {
        let tag = FrameTag::Motion { area: result.area };
        let interval = Duration::from_millis(self.capture.motion.burst_interval_ms);

        let first = if self.capture.motion.annotate {
            Frame::new(result.annotated, trigger.captured_at())
        } else {
            trigger.clone()
        };
        if !self.send(first, tag).await {
            return None;
        }

        let mut last = trigger;
        for _ in 1..self.capture.motion.burst_frames.max(1) {
            if !self.pause(interval).await {
                return None;
            }

            let mut next = self.latest_frame().filter(|f| !f.same_content(&last));
            if next.is_none() {
                if !self.pause(interval * 2).await {
                    return None;
                }
                next = self.latest_frame().filter(|f| !f.same_content(&last));
            }

            let Some(frame) = next else {
                self.totals.stale_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if !self.acceptable(&frame).await {
                continue;
            }
            if !self.send(frame.clone(), tag).await {
                return None;
            }
            last = frame;
        }
        Some(last)
    }

    /// Newest frame not handed out before
    fn latest_frame(&self) -> Option<Frame> {
        let mut latest = None;
        while let Some(frame) = self.buffer.read_fresh() {
            latest = Some(frame);
        }
        latest
    }

    async fn acceptable(&self, frame: &Frame) -> bool {
        let validator = self.validator.clone();
        let image_frame = frame.clone();
        let min_sharpness = self.capture.min_sharpness;
        let kind = self.identity.kind;
        let checked = tokio::task::spawn_blocking(move || {
            validator.assess(image_frame.image(), kind, min_sharpness)
        })
        .await;
        let quality = match checked {
            Ok(quality) => quality,
            Err(e) => {
                tracing::error!(
                    camera_id = %self.identity.camera_id,
                    error = %e,
                    "Frame check failed"
                );
                return false;
            }
        };

        if let Some(corruption) = &quality.corruption {
            self.totals.corrupt_discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                camera_id = %self.identity.camera_id,
                reason = %corruption,
                "Corrupt frame discarded"
            );
            return false;
        }
        if quality.too_small {
            self.totals.corrupt_discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(camera_id = %self.identity.camera_id, "Undersized frame discarded");
            return false;
        }
        if quality.blurry {
            self.totals.blurry_frames.fetch_add(1, Ordering::Relaxed);
            if self.capture.reject_blurry {
                tracing::debug!(
                    camera_id = %self.identity.camera_id,
                    sharpness = quality.sharpness,
                    "Blurry frame discarded"
                );
                return false;
            }
        }
        true
    }

    async fn compare(&self, previous: Frame, current: Frame) -> Option<MotionResult> {
        let _permit = self.motion_permits.acquire().await.ok()?;
        let detector = self.detector.clone();
        let detected =
            tokio::task::spawn_blocking(move || detector.detect(current.image(), previous.image()))
                .await;
        match detected {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(
                    camera_id = %self.identity.camera_id,
                    error = %e,
                    "Motion check failed"
                );
                None
            }
        }
    }

    /// False once the line sink is gone
    async fn send(&self, frame: Frame, tag: FrameTag) -> bool {
        let captured = CapturedFrame {
            line_id: self.identity.line_id.clone(),
            camera_id: self.identity.camera_id.clone(),
            position: self.identity.position.clone(),
            frame,
            tag,
        };
        if self.tx.send(captured).await.is_err() {
            tracing::warn!(
                camera_id = %self.identity.camera_id,
                "Line sink closed, camera task ending"
            );
            return false;
        }
        self.totals.frames_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Sleep unless shutdown arrives first
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_manager::BatchManagerConfig;
    use crate::batch_store::{BatchStatus, BatchStore};
    use crate::config_store::SourceKind;
    use crate::db::Database;
    use crate::frame_source::{CaptureError, SourceStatus};
    use crate::processor::ProcessorInstance;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};

    /// Textured scene with a white block that moves on every read
    struct MovingBlockSource {
        camera_id: String,
        seq: u32,
        opened: bool,
    }

    impl MovingBlockSource {
        fn boxed(camera_id: &str) -> Box<dyn FrameSource> {
            Box::new(Self {
                camera_id: camera_id.to_string(),
                seq: 0,
                opened: false,
            })
        }

        fn scene(seq: u32) -> RgbImage {
            let offset = (seq * 40) % 240;
            RgbImage::from_fn(320, 240, |x, y| {
                if x >= offset && x < offset + 60 && (90..150).contains(&y) {
                    Rgb([255, 255, 255])
                } else {
                    let v = ((x * 7 + y * 13) % 200) as u8;
                    Rgb([v, v, v])
                }
            })
        }
    }

    #[async_trait]
    impl FrameSource for MovingBlockSource {
        fn camera_id(&self) -> &str {
            &self.camera_id
        }

        async fn open(&mut self) -> Result<(), CaptureError> {
            self.opened = true;
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, CaptureError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seq += 1;
            Ok(Frame::new(Self::scene(self.seq), Utc::now()))
        }

        async fn release(&mut self) {
            self.opened = false;
        }

        fn describe(&self) -> SourceStatus {
            SourceStatus {
                camera_id: self.camera_id.clone(),
                kind: SourceKind::Video,
                target: "scene".into(),
                opened: self.opened,
                resolution: (320, 240),
                frames_read: self.seq as u64,
                last_frame_at: None,
                fps: 0.0,
            }
        }
    }

    /// Moving-block scene with a bright green strip across the top
    struct GreenStripSource {
        inner: MovingBlockSource,
        kind: SourceKind,
    }

    #[async_trait]
    impl FrameSource for GreenStripSource {
        fn camera_id(&self) -> &str {
            self.inner.camera_id()
        }

        async fn open(&mut self) -> Result<(), CaptureError> {
            self.inner.open().await
        }

        async fn read(&mut self) -> Result<Frame, CaptureError> {
            let frame = self.inner.read().await?;
            let mut image = frame.image().clone();
            for y in 0..60 {
                for x in 0..image.width() {
                    image.put_pixel(x, y, Rgb([10, 220, 30]));
                }
            }
            Ok(Frame::new(image, frame.captured_at()))
        }

        async fn release(&mut self) {
            self.inner.release().await
        }

        fn describe(&self) -> SourceStatus {
            SourceStatus {
                kind: self.kind,
                ..self.inner.describe()
            }
        }
    }

    fn green_setup(line: &str, camera: &str, kind: SourceKind) -> CameraSetup {
        let mut setup = setup_for(line, camera);
        setup.identity.kind = kind;
        setup.source = Box::new(GreenStripSource {
            inner: MovingBlockSource {
                camera_id: camera.to_string(),
                seq: 0,
                opened: false,
            },
            kind,
        });
        setup
    }

    fn setup_for(line: &str, camera: &str) -> CameraSetup {
        CameraSetup {
            identity: CameraIdentity {
                camera_id: camera.to_string(),
                line_id: line.to_string(),
                kind: SourceKind::Video,
                target: "scene".to_string(),
                position: "gate".to_string(),
            },
            source: MovingBlockSource::boxed(camera),
            reconnect_delay: None,
        }
    }

    struct Setup {
        _tmp: tempfile::TempDir,
        store: Arc<BatchStore>,
        manager: Arc<BatchDirectoryManager>,
        registry: Arc<CameraRegistry>,
        service: CaptureService,
    }

    async fn setup(config: AppConfig) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let store = Arc::new(BatchStore::new(&db, ProcessorInstance::generate()));
        let manager = Arc::new(BatchDirectoryManager::new(
            BatchManagerConfig {
                frames_dir: tmp.path().join("frames"),
                ..Default::default()
            },
            store.clone(),
        ));
        let registry = Arc::new(CameraRegistry::new());
        let service = CaptureService::new(&config, manager.clone(), registry.clone());
        Setup {
            _tmp: tmp,
            store,
            manager,
            registry,
            service,
        }
    }

    async fn written_files(store: &BatchStore, line: &str) -> (usize, Vec<String>) {
        let batches = store.list(line, BatchStatus::Pending, 10).await.unwrap();
        let mut names = Vec::new();
        for batch in &batches {
            for entry in std::fs::read_dir(&batch.location).unwrap() {
                names.push(entry.unwrap().file_name().to_string_lossy().into_owned());
            }
        }
        (batches.len(), names)
    }

    #[tokio::test]
    async fn test_interval_capture_writes_and_finalizes() {
        let mut config = AppConfig::default();
        config.capture.interval_secs = 0.05;
        let s = setup(config).await;

        let started = s
            .service
            .start_with_sources(vec![setup_for("L1", "L1_cam_0"), setup_for("L1", "L1_cam_1")])
            .await;
        assert_eq!(started, 2);
        assert!(s.service.is_running().await);
        assert!(s.registry.contains("L1_cam_0").await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        s.service.stop().await;
        assert!(!s.service.is_running().await);

        let (batches, names) = written_files(&s.store, "L1").await;
        assert!(batches >= 1);
        assert!(!names.is_empty());
        assert_eq!(names.len() as u64, s.manager.stats().frames_written);
        assert_eq!(names.len() as u64, s.service.stats().frames_sent);
        assert!(names.iter().all(|n| n.starts_with("gate_frame_")));
        assert!(s.manager.current_bucket("L1").await.is_none());
    }

    #[tokio::test]
    async fn test_motion_capture_tags_bursts() {
        let mut config = AppConfig::default();
        config.capture.mode = CaptureMode::Motion;
        config.capture.motion.threshold = 500.0;
        config.capture.motion.min_area = 50.0;
        config.capture.motion.burst_frames = 3;
        config.capture.motion.burst_interval_ms = 20;
        config.capture.motion.check_interval_ms = 30;
        let s = setup(config).await;

        s.service.start_with_sources(vec![setup_for("L2", "L2_cam_0")]).await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        s.service.stop().await;

        let stats = s.service.stats();
        assert!(stats.motion_events >= 1);

        let (_, names) = written_files(&s.store, "L2").await;
        assert!(!names.is_empty());
        assert!(names.iter().all(|n| n.starts_with("gate_motion")));
    }

    #[tokio::test]
    async fn test_green_scene_kept_for_usb_dropped_for_ip() {
        let mut config = AppConfig::default();
        config.capture.interval_secs = 0.05;
        let s = setup(config).await;

        s.service
            .start_with_sources(vec![
                green_setup("L1", "L1_usb_0", SourceKind::Usb),
                green_setup("L2", "L2_ip_0", SourceKind::Ip),
            ])
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        s.service.stop().await;

        let (_, usb_frames) = written_files(&s.store, "L1").await;
        let (ip_batches, ip_frames) = written_files(&s.store, "L2").await;
        assert!(!usb_frames.is_empty());
        assert_eq!(ip_batches, 0);
        assert!(ip_frames.is_empty());
        assert!(s.service.stats().corrupt_discarded >= 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let s = setup(AppConfig::default()).await;
        s.service.stop().await;
        assert_eq!(s.service.stats(), CaptureStats::default());
    }
}
