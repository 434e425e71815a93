//! Application state
//!
//! Holds all shared components and wires them from `AppConfig`

use crate::batch_manager::{BatchDirectoryManager, BatchManagerConfig};
use crate::batch_store::BatchStore;
use crate::camera_registry::CameraRegistry;
use crate::capture_service::CaptureService;
use crate::circuit_breaker::CircuitBreaker;
use crate::config_store::AppConfig;
use crate::db::Database;
use crate::detection_log_service::DetectionLogService;
use crate::employee_registry::{EmployeeRegistry, SqlEmployeeRegistry};
use crate::error::Result;
use crate::face_client::{FaceEmbedder, HttpFaceEmbedder};
use crate::processing_engine::{EngineConfig, ProcessingEngine};
use crate::processor::ProcessorInstance;
use crate::quarantine::QuarantineHandler;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Shared components of one running instance
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub processor: ProcessorInstance,
    pub store: Arc<BatchStore>,
    pub detection_log: Arc<DetectionLogService>,
    pub cameras: Arc<CameraRegistry>,
    pub batches: Arc<BatchDirectoryManager>,
    pub capture: Arc<CaptureService>,
    /// Absent when processing is disabled
    pub engine: Option<Arc<ProcessingEngine>>,
}

impl AppState {
    /// Connect to the store and build every component. Store or registry
    /// failures here are fatal.
    pub async fn build(config: AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database.url, config.database.max_connections).await?;
        let processor = ProcessorInstance::from_config(config.processor_id.as_deref());
        tracing::info!(processor_id = %processor, "Processor identity");

        let store = Arc::new(BatchStore::new(&db, processor.clone()));
        let detection_log = Arc::new(DetectionLogService::new(&db));
        let cameras = Arc::new(CameraRegistry::new());

        let batches = Arc::new(BatchDirectoryManager::new(
            BatchManagerConfig {
                frames_dir: config.storage.frames_dir.clone(),
                window_secs: config.capture.window_secs,
                jpeg_quality: config.capture.jpeg_quality,
                encode_workers: config.capture.workers,
            },
            store.clone(),
        ));
        let capture = Arc::new(CaptureService::new(&config, batches.clone(), cameras.clone()));

        let engine = if config.processing.enabled {
            let embedder: Arc<dyn FaceEmbedder> = Arc::new(HttpFaceEmbedder::with_timeout(
                config.processing.embedding_url.clone(),
                Duration::from_secs(config.processing.embedding_timeout_secs),
            )?);
            let registry: Arc<dyn EmployeeRegistry> =
                Arc::new(SqlEmployeeRegistry::load(&db).await?);

            Some(Arc::new(ProcessingEngine::new(
                EngineConfig::from(&config),
                store.clone(),
                detection_log.clone(),
                embedder,
                registry,
                Arc::new(CircuitBreaker::from_config("processing", &config.circuit_breaker)),
                QuarantineHandler::from_config(&config.storage),
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            db,
            processor,
            store,
            detection_log,
            cameras,
            batches,
            capture,
            engine,
        })
    }

    /// Start capture and processing according to the enable flags
    pub async fn start(&self) {
        if self.config.capture.enabled {
            let started = self.capture.start(&self.config).await;
            if started == 0 {
                tracing::warn!("Capture enabled but no camera could be started");
            }
        } else {
            tracing::info!("Capture disabled");
        }

        match &self.engine {
            Some(engine) => engine.start().await,
            None => tracing::info!("Processing disabled"),
        }
    }

    /// Stop capture first so the last windows are registered, then let
    /// the engine finish its in-flight batch
    pub async fn shutdown(&self) {
        self.capture.stop().await;
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
        self.db.close().await;
    }

    /// One periodic metrics line per subsystem
    pub async fn log_metrics(&self, window: Duration) {
        let since = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(1));
        match self.store.stats(since).await {
            Ok(stats) => tracing::info!(
                pending = stats.pending,
                processing = stats.processing,
                completed = stats.completed,
                error = stats.error,
                completed_in_window = stats.completed_in_window,
                avg_processing_secs = stats.avg_processing_seconds.unwrap_or(0.0),
                "Batch metrics"
            ),
            Err(e) => tracing::warn!(error = %e, "Batch metrics unavailable"),
        }

        if self.config.capture.enabled {
            let capture = self.capture.stats();
            let batches = self.batches.stats();
            let cameras_online = self.cameras.online_count().await;
            tracing::info!(
                cameras_online,
                frames_sent = capture.frames_sent,
                corrupt_discarded = capture.corrupt_discarded,
                blurry_frames = capture.blurry_frames,
                motion_events = capture.motion_events,
                batches_registered = batches.batches_registered,
                registration_failures = batches.registration_failures,
                "Capture metrics"
            );
            for camera in self.cameras.snapshot().await {
                tracing::info!(
                    camera_id = %camera.identity.camera_id,
                    line_id = %camera.identity.line_id,
                    connection = ?camera.connection,
                    fps = camera.counters.fps,
                    frames_captured = camera.counters.frames_captured,
                    frames_dropped = camera.counters.frames_dropped,
                    duplicates = camera.counters.duplicates_discarded,
                    reconnects = camera.reconnects,
                    "Camera metrics"
                );
            }
        }

        if let Some(engine) = &self.engine {
            let stats = engine.stats().await;
            tracing::info!(
                cycles = stats.cycles,
                failed_cycles = stats.failed_cycles,
                completed = stats.batches_completed,
                failed = stats.batches_failed,
                released = stats.batches_released,
                frames_processed = stats.frames_processed,
                frames_failed = stats.frames_failed,
                breaker = ?engine.breaker().state(),
                "Processing metrics"
            );
        }
    }
}
