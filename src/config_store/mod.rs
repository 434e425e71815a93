//! ConfigStore - typed startup configuration
//!
//! ## Responsibilities
//!
//! - Load `AppConfig` from a TOML file (path from `LINEWATCH_CONFIG`)
//! - Apply environment overrides
//! - Validate once; components receive the typed config by reference

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default config file when `LINEWATCH_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "linewatch.toml";

/// Loader for `AppConfig`
pub struct ConfigStore;

impl ConfigStore {
    /// Load from `LINEWATCH_CONFIG` (or the default path) plus process env
    pub fn load_from_env() -> Result<AppConfig> {
        let path = std::env::var("LINEWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path, |key| std::env::var(key).ok())
    }

    /// Load a config file; a missing file yields defaults
    pub fn load<F>(path: &Path, env: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Self::parse(&raw)?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            AppConfig::default()
        };

        Self::apply_env_overrides(&mut config, env)?;
        Self::validate(&config)?;

        tracing::info!(
            path = %path.display(),
            lines = config.lines.len(),
            capture_mode = config.capture.mode.as_str(),
            capture_enabled = config.capture.enabled,
            processing_enabled = config.processing.enabled,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<AppConfig> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    pub fn apply_env_overrides<F>(config: &mut AppConfig, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(url) = env("EMBEDDING_URL") {
            config.processing.embedding_url = url;
        }
        if let Some(id) = env("PROCESSOR_ID") {
            config.processor_id = Some(id);
        }
        if let Some(mode) = env("CAPTURE_MODE") {
            config.capture.mode = mode.parse().map_err(Error::Config)?;
        }
        if let Some(flag) = env("ENABLE_CAPTURE") {
            config.capture.enabled = parse_flag("ENABLE_CAPTURE", &flag)?;
        }
        if let Some(flag) = env("ENABLE_PROCESSING") {
            config.processing.enabled = parse_flag("ENABLE_PROCESSING", &flag)?;
        }
        if let Some(dir) = env("FRAMES_DIR") {
            config.storage.frames_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env("QUARANTINE_DIR") {
            config.storage.quarantine_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(config: &AppConfig) -> Result<()> {
        let capture = &config.capture;
        let processing = &config.processing;

        if config.database.url.trim().is_empty() {
            return Err(Error::Config("database.url must be set".into()));
        }
        if !(2..=8).contains(&capture.buffer_capacity) {
            return Err(Error::Config(format!(
                "capture.buffer_capacity must be within 2..=8, got {}",
                capture.buffer_capacity
            )));
        }
        if capture.window_secs == 0 {
            return Err(Error::Config("capture.window_secs must be >= 1".into()));
        }
        if !(capture.interval_secs > 0.0) {
            return Err(Error::Config("capture.interval_secs must be > 0".into()));
        }
        if capture.workers == 0 || capture.motion.workers == 0 || processing.max_workers == 0 {
            return Err(Error::Config("worker pool sizes must be >= 1".into()));
        }
        if capture.motion.burst_frames == 0 {
            return Err(Error::Config("capture.motion.burst_frames must be >= 1".into()));
        }
        if !(processing.face_match_tolerance > 0.0) {
            return Err(Error::Config(
                "processing.face_match_tolerance must be > 0".into(),
            ));
        }
        if processing.claim_batch_size == 0 {
            return Err(Error::Config("processing.claim_batch_size must be >= 1".into()));
        }
        if processing.lock_timeout_secs == 0 {
            return Err(Error::Config("processing.lock_timeout_secs must be >= 1".into()));
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be >= 1".into(),
            ));
        }

        let mut line_ids = HashSet::new();
        let mut camera_ids = HashSet::new();
        for line in &config.lines {
            if line.id.trim().is_empty() {
                return Err(Error::Config("line id must not be empty".into()));
            }
            if !line_ids.insert(line.id.as_str()) {
                return Err(Error::Config(format!("duplicate line id '{}'", line.id)));
            }
            for (index, camera) in line.cameras.iter().enumerate() {
                let camera_id = camera.camera_id(&line.id, index);
                let missing = match camera.kind {
                    SourceKind::Usb => camera.device.is_none(),
                    SourceKind::Ip => camera.url.as_deref().map_or(true, str::is_empty),
                    SourceKind::Video => camera.path.is_none(),
                };
                if missing {
                    return Err(Error::Config(format!(
                        "camera '{}' ({}) is missing its {}",
                        camera_id,
                        camera.kind.as_str(),
                        match camera.kind {
                            SourceKind::Usb => "device index",
                            SourceKind::Ip => "url",
                            SourceKind::Video => "path",
                        }
                    )));
                }
                if camera.resolution.0 == 0 || camera.resolution.1 == 0 {
                    return Err(Error::Config(format!(
                        "camera '{}' has an empty resolution",
                        camera_id
                    )));
                }
                if !camera_ids.insert(camera_id.clone()) {
                    return Err(Error::Config(format!("duplicate camera id '{}'", camera_id)));
                }
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{}: not a boolean '{}'", key, other))),
    }
}
