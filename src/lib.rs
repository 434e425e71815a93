//! linewatch
//!
//! Captures frames from the cameras of each production line, groups them
//! into time-windowed batches and turns every batch into a face-matching
//! detection record.
//!
//! ## Pipeline
//!
//! 1. FrameSource - USB, IP/RTSP and video file capture (ffmpeg pipe)
//! 2. AsyncFrameBuffer - background read loop, dedup, reconnect
//! 3. MotionDetector - optional frame-pair gate
//! 4. BatchDirectoryManager - per-line time-window buckets
//! 5. BatchStore - shared claim/transition state machine
//! 6. ProcessingEngine - worker pool, aggregation, detection records
//! 7. CircuitBreaker / QuarantineHandler - resilience around 2 and 6
//!
//! Multiple processor instances may share one store; the conditional
//! claim in BatchStore is the only arbiter between them.

pub mod batch_manager;
pub mod batch_store;
pub mod camera_registry;
pub mod capture_service;
pub mod circuit_breaker;
pub mod config_store;
pub mod db;
pub mod detection_log_service;
pub mod employee_registry;
pub mod error;
pub mod face_client;
pub mod frame_buffer;
pub mod frame_source;
pub mod frame_validator;
pub mod motion_detector;
pub mod processing_engine;
pub mod processor;
pub mod quarantine;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
