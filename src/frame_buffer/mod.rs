//! AsyncFrameBuffer - background capture loop per source
//!
//! ## Responsibilities
//!
//! - Continuously read a `FrameSource` on its own task, decoupled from the
//!   consumer's cadence
//! - Small bounded queue; when full the oldest frame is dropped and counted
//! - Drop a frame identical to the one accepted just before it
//! - Reopen lost sources with backoff, through the reconnect circuit breaker
//! - Bounded `stop()` that always releases the source
//!
//! `read()` never blocks: it hands out the next queued frame, or repeats
//! the last good frame while the source stalls.

use crate::camera_registry::{CameraRegistry, CaptureCounters};
use crate::circuit_breaker::CircuitBreaker;
use crate::config_store::CaptureConfig;
use crate::frame_source::{CaptureError, Frame, FrameSource, RateMeter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    pub stop_timeout: Duration,
    /// Consecutive read failures tolerated before the source is reopened
    pub max_consecutive_errors: u32,
    pub reconnect_delay: Duration,
    /// Reopen attempts at `reconnect_delay` before the slower backoff
    pub max_rapid_reconnects: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for BufferConfig {
    fn from(c: &CaptureConfig) -> Self {
        Self {
            capacity: c.buffer_capacity.max(1),
            stop_timeout: Duration::from_millis(c.stop_timeout_ms),
            max_consecutive_errors: c.max_consecutive_errors.max(1),
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            max_rapid_reconnects: c.max_rapid_reconnects,
        }
    }
}

impl BufferConfig {
    /// Same config with a camera's own reconnect delay, if it has one
    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        if let Some(delay) = delay {
            self.reconnect_delay = delay;
        }
        self
    }

    /// Delay before reopen attempt number `attempt` (1-based)
    fn reconnect_backoff(&self, attempt: u32) -> Duration {
        if attempt <= self.max_rapid_reconnects {
            self.reconnect_delay
        } else {
            (self.reconnect_delay * 5).min(Duration::from_secs(60))
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
    corrupt: AtomicU64,
    read_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time buffer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub duplicates_discarded: u64,
    pub corrupt_discarded: u64,
    pub read_errors: u64,
    pub reconnects: u64,
    pub fps: f64,
    pub opened: bool,
}

struct Shared {
    capacity: usize,
    queue: Mutex<VecDeque<Frame>>,
    last_frame: Mutex<Option<Frame>>,
    rate: Mutex<RateMeter>,
    counters: Counters,
    opened: AtomicBool,
}

impl Shared {
    fn push(&self, frame: Frame) {
        {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame.clone());
        }
        *lock(&self.last_frame) = Some(frame);
        lock(&self.rate).tick();
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> BufferStats {
        let c = &self.counters;
        BufferStats {
            frames_captured: c.captured.load(Ordering::Relaxed),
            frames_dropped: c.dropped.load(Ordering::Relaxed),
            duplicates_discarded: c.duplicates.load(Ordering::Relaxed),
            corrupt_discarded: c.corrupt.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            fps: lock(&self.rate).fps(),
            opened: self.opened.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct AsyncFrameBuffer {
    camera_id: String,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl AsyncFrameBuffer {
    /// Spawn the capture loop. The source is moved into the loop and
    /// released when the loop ends, however it ends.
    pub fn start(
        source: Box<dyn FrameSource>,
        config: BufferConfig,
        breaker: Arc<CircuitBreaker>,
        registry: Arc<CameraRegistry>,
    ) -> Self {
        let camera_id = source.camera_id().to_string();
        let shared = Arc::new(Shared {
            capacity: config.capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
            last_frame: Mutex::new(None),
            rate: Mutex::new(RateMeter::default()),
            counters: Counters::default(),
            opened: AtomicBool::new(false),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_timeout = config.stop_timeout;

        let capture = CaptureLoop {
            camera_id: camera_id.clone(),
            source,
            shared: shared.clone(),
            config,
            breaker,
            registry,
            stop_rx,
        };
        let task = tokio::spawn(capture.run());

        tracing::debug!(camera_id = %camera_id, "Frame buffer started");

        Self {
            camera_id,
            shared,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
            stop_timeout,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Next frame, or the last good frame when nothing new arrived.
    /// `NotOpened` only if the source never produced a frame.
    pub fn read(&self) -> Result<Frame, CaptureError> {
        if let Some(frame) = lock(&self.shared.queue).pop_front() {
            return Ok(frame);
        }
        lock(&self.shared.last_frame)
            .clone()
            .ok_or(CaptureError::NotOpened)
    }

    /// Like `read`, but only frames not handed out before
    pub fn read_fresh(&self) -> Option<Frame> {
        lock(&self.shared.queue).pop_front()
    }

    pub fn stats(&self) -> BufferStats {
        self.shared.stats()
    }

    pub fn is_opened(&self) -> bool {
        self.shared.opened.load(Ordering::Relaxed)
    }

    /// Stop the loop and release the source within `stop_timeout`. A loop
    /// that does not exit in time is aborted, which drops (and kills) the
    /// source.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(_) => {
                tracing::debug!(camera_id = %self.camera_id, "Frame buffer stopped");
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    camera_id = %self.camera_id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Capture loop did not stop in time, aborted"
                );
            }
        }
        self.shared.opened.store(false, Ordering::Relaxed);
    }
}

struct CaptureLoop {
    camera_id: String,
    source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    config: BufferConfig,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<CameraRegistry>,
    stop_rx: watch::Receiver<bool>,
}

enum Step {
    Continue,
    Stop,
}

impl CaptureLoop {
    async fn run(mut self) {
        let mut opened = false;
        let mut reopen_attempts = 0u32;
        let mut consecutive_errors = 0u32;
        let mut last_digest: Option<[u8; 20]> = None;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            if !opened {
                match self.reopen(&mut reopen_attempts).await {
                    Some(true) => {
                        opened = true;
                        consecutive_errors = 0;
                        last_digest = None;
                    }
                    Some(false) => continue,
                    None => break,
                }
            }

            let result = tokio::select! {
                r = self.source.read() => r,
                _ = self.stop_rx.changed() => break,
            };

            match result {
                Ok(frame) => {
                    consecutive_errors = 0;
                    if last_digest.as_ref() == Some(frame.digest()) {
                        self.shared.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    last_digest = Some(*frame.digest());
                    let at = frame.captured_at();
                    self.shared.push(frame);
                    self.publish(at).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    match &e {
                        CaptureError::Corrupt(_) => {
                            self.shared.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            self.shared.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    let source_closed = !self.source.describe().opened;
                    if source_closed || consecutive_errors >= self.config.max_consecutive_errors {
                        tracing::warn!(
                            camera_id = %self.camera_id,
                            error = %e,
                            consecutive_errors,
                            "Source read failing, reconnecting"
                        );
                        self.source.release().await;
                        opened = false;
                        self.shared.opened.store(false, Ordering::Relaxed);
                        self.shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.registry.record_reconnect(&self.camera_id).await;
                        let _ = self
                            .registry
                            .update_connection(&self.camera_id, false, Some(&e.to_string()))
                            .await;
                    } else if let Step::Stop = self.pause(Duration::from_millis(100)).await {
                        break;
                    }
                }
            }
        }

        self.source.release().await;
        self.shared.opened.store(false, Ordering::Relaxed);
        tracing::debug!(camera_id = %self.camera_id, "Capture loop exited, source released");
    }

    /// One reopen attempt. `Some(true)` opened, `Some(false)` retry later,
    /// `None` stop requested.
    async fn reopen(&mut self, attempts: &mut u32) -> Option<bool> {
        if *attempts > 0 {
            let delay = self.config.reconnect_backoff(*attempts);
            if let Step::Stop = self.pause(delay).await {
                return None;
            }
        }
        *attempts += 1;

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(
                    camera_id = %self.camera_id,
                    "Reconnect breaker open, skipping attempt"
                );
                return Some(false);
            }
        };

        let result = tokio::select! {
            r = self.source.open() => r,
            _ = self.stop_rx.changed() => return None,
        };

        match result {
            Ok(()) => {
                permit.success();
                *attempts = 0;
                self.shared.opened.store(true, Ordering::Relaxed);
                let _ = self
                    .registry
                    .update_connection(&self.camera_id, true, None)
                    .await;
                Some(true)
            }
            Err(e) => {
                permit.failure();
                tracing::warn!(
                    camera_id = %self.camera_id,
                    attempt = *attempts,
                    error = %e,
                    "Source open failed"
                );
                let _ = self
                    .registry
                    .update_connection(&self.camera_id, false, Some(&e.to_string()))
                    .await;
                Some(false)
            }
        }
    }

    async fn pause(&mut self, delay: Duration) -> Step {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Step::Continue,
            _ = self.stop_rx.changed() => Step::Stop,
        }
    }

    async fn publish(&self, at: chrono::DateTime<chrono::Utc>) {
        let stats = self.shared.stats();
        let counters = CaptureCounters {
            frames_captured: stats.frames_captured,
            frames_dropped: stats.frames_dropped,
            duplicates_discarded: stats.duplicates_discarded,
            corrupt_discarded: stats.corrupt_discarded,
            fps: stats.fps,
        };
        self.registry.record_frame(&self.camera_id, at, counters).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_registry::{CameraIdentity, ConnectionStatus};
    use crate::config_store::SourceKind;
    use crate::frame_source::SourceStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    /// Source fed by the test; an empty channel means a stalled camera
    struct ScriptedSource {
        frames: mpsc::UnboundedReceiver<Result<Frame, CaptureError>>,
        opened: bool,
        fail_open: bool,
        open_calls: Arc<AtomicU32>,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        fn camera_id(&self) -> &str {
            "cam1"
        }

        async fn open(&mut self) -> Result<(), CaptureError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(CaptureError::ReadFailed("no device".into()));
            }
            self.opened = true;
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, CaptureError> {
            match self.frames.recv().await {
                Some(r) => r,
                None => std::future::pending().await,
            }
        }

        async fn release(&mut self) {
            self.opened = false;
            self.released.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> SourceStatus {
            SourceStatus {
                camera_id: "cam1".into(),
                kind: SourceKind::Usb,
                target: "test".into(),
                opened: self.opened,
                resolution: (8, 8),
                frames_read: 0,
                last_frame_at: None,
                fps: 0.0,
            }
        }
    }

    struct Harness {
        tx: mpsc::UnboundedSender<Result<Frame, CaptureError>>,
        open_calls: Arc<AtomicU32>,
        released: Arc<AtomicBool>,
        registry: Arc<CameraRegistry>,
        breaker: Arc<CircuitBreaker>,
        buffer: AsyncFrameBuffer,
    }

    async fn harness(capacity: usize, fail_open: bool) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let open_calls = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(CameraRegistry::new());
        registry
            .register(CameraIdentity {
                camera_id: "cam1".into(),
                line_id: "L1".into(),
                kind: SourceKind::Usb,
                target: "test".into(),
                position: "front".into(),
            })
            .await;
        let breaker = Arc::new(CircuitBreaker::new("reconnect", 2, Duration::from_secs(60)));

        let source = ScriptedSource {
            frames: rx,
            opened: false,
            fail_open,
            open_calls: open_calls.clone(),
            released: released.clone(),
        };
        let config = BufferConfig {
            capacity,
            stop_timeout: Duration::from_millis(500),
            max_consecutive_errors: 5,
            reconnect_delay: Duration::from_millis(10),
            max_rapid_reconnects: 10,
        };
        let buffer =
            AsyncFrameBuffer::start(Box::new(source), config, breaker.clone(), registry.clone());

        Harness {
            tx,
            open_calls,
            released,
            registry,
            breaker,
            buffer,
        }
    }

    fn frame(shade: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(8, 8, Rgb([shade, 0, 0])), Utc::now())
    }

    async fn wait_for<F: Fn(&BufferStats) -> bool>(buffer: &AsyncFrameBuffer, cond: F) {
        for _ in 0..200 {
            if cond(&buffer.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", buffer.stats());
    }

    #[test]
    fn test_camera_reconnect_delay_overrides_default() {
        let config = BufferConfig {
            reconnect_delay: Duration::from_millis(2000),
            max_rapid_reconnects: 2,
            ..Default::default()
        };
        let own = config.clone().with_reconnect_delay(Some(Duration::from_secs(7)));
        assert_eq!(own.reconnect_backoff(1), Duration::from_secs(7));
        assert_eq!(own.reconnect_backoff(3), Duration::from_secs(35));

        let shared = config.with_reconnect_delay(None);
        assert_eq!(shared.reconnect_backoff(1), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_read_before_first_frame_is_not_opened() {
        let h = harness(3, false).await;
        assert_eq!(h.buffer.read().unwrap_err(), CaptureError::NotOpened);
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_consecutive_duplicates_are_discarded() {
        let h = harness(3, false).await;
        for shade in [1, 1, 2, 2, 3] {
            h.tx.send(Ok(frame(shade))).unwrap();
        }
        wait_for(&h.buffer, |s| s.frames_captured == 3 && s.duplicates_discarded == 2).await;

        let mut previous: Option<Frame> = None;
        for _ in 0..3 {
            let f = h.buffer.read().unwrap();
            if let Some(prev) = &previous {
                assert!(!prev.same_content(&f));
            }
            previous = Some(f);
        }
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_stall_repeats_last_good_frame() {
        let h = harness(3, false).await;
        h.tx.send(Ok(frame(7))).unwrap();
        wait_for(&h.buffer, |s| s.frames_captured == 1).await;

        let first = h.buffer.read().unwrap();
        // source stalls: nothing new arrives
        for _ in 0..3 {
            let again = h.buffer.read().unwrap();
            assert!(again.same_content(&first));
        }
        assert!(h.buffer.read_fresh().is_none());
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let h = harness(2, false).await;
        for shade in 1..=5 {
            h.tx.send(Ok(frame(shade))).unwrap();
        }
        wait_for(&h.buffer, |s| s.frames_captured == 5).await;

        let stats = h.buffer.stats();
        assert_eq!(stats.frames_dropped, 3);
        assert!(h.buffer.read().unwrap().same_content(&frame(4)));
        assert!(h.buffer.read().unwrap().same_content(&frame(5)));
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_stalled_source() {
        let h = harness(2, false).await;
        wait_for(&h.buffer, |s| s.opened).await;

        let started = std::time::Instant::now();
        h.buffer.stop().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(h.released.load(Ordering::SeqCst));
        assert!(!h.buffer.is_opened());
        // idempotent
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_read_errors_trigger_reconnect() {
        let h = harness(2, false).await;
        h.tx.send(Ok(frame(1))).unwrap();
        for _ in 0..5 {
            h.tx.send(Err(CaptureError::ReadFailed("glitch".into()))).unwrap();
        }
        h.tx.send(Ok(frame(2))).unwrap();
        wait_for(&h.buffer, |s| s.frames_captured == 2).await;

        let stats = h.buffer.stats();
        assert_eq!(stats.read_errors, 5);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(h.open_calls.load(Ordering::SeqCst), 2);

        let state = h.registry.get("cam1").await.unwrap();
        assert_eq!(state.reconnects, 1);
        assert_eq!(state.connection, ConnectionStatus::Online);
        h.buffer.stop().await;
    }

    #[tokio::test]
    async fn test_failing_open_trips_reconnect_breaker() {
        let h = harness(2, true).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // threshold 2: after two failed opens the breaker stops further attempts
        assert_eq!(h.open_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.breaker.state(), crate::circuit_breaker::BreakerState::Open);
        assert_eq!(
            h.registry.get("cam1").await.unwrap().connection,
            ConnectionStatus::Offline
        );
        h.buffer.stop().await;
        assert!(h.released.load(Ordering::SeqCst));
    }
}
