//! QuarantineHandler - keep failed batches for inspection
//!
//! ## Responsibilities
//!
//! - Copy a failed batch directory to
//!   `{quarantine_dir}/{line}_{name}_{timestamp}`, with a `_{n}` suffix when
//!   that name is taken; an existing directory is never written into
//! - Write `{dest}_error.txt` with the error, original location and time
//!
//! Never fails the caller: problems here are logged and swallowed.

use crate::config_store::StorageConfig;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone)]
pub struct QuarantineHandler {
    enabled: bool,
    dir: PathBuf,
}

impl QuarantineHandler {
    pub fn new(enabled: bool, dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            dir: dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.quarantine_enabled, config.quarantine_dir.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `location` into quarantine. Returns the destination on success.
    pub async fn quarantine(&self, line_id: &str, location: &str, error: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let now = Utc::now();

        let source = PathBuf::from(location);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch".to_string());
        let base = format!("{}_{}_{}", file_safe(line_id), name, now.format("%Y%m%d_%H%M%S"));

        let root = self.dir.clone();
        let copied =
            tokio::task::spawn_blocking(move || copy_to_fresh_dir(&source, &root, &base)).await;

        let (dest, copied_files) = match copied {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                tracing::error!(
                    line_id = %line_id,
                    location = %location,
                    error = %e,
                    "Quarantine copy failed"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(location = %location, error = %e, "Quarantine task failed");
                return None;
            }
        };

        let sidecar = sidecar_path(&dest);
        if let Err(e) = tokio::fs::write(&sidecar, sidecar_contents(location, error, now)).await {
            tracing::error!(
                sidecar = %sidecar.display(),
                error = %e,
                "Quarantine sidecar write failed"
            );
        }

        tracing::warn!(
            line_id = %line_id,
            location = %location,
            dest = %dest.display(),
            files = copied_files,
            "Batch quarantined"
        );
        Some(dest)
    }
}

pub fn sidecar_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push("_error.txt");
    PathBuf::from(name)
}

fn sidecar_contents(location: &str, error: &str, at: DateTime<Utc>) -> String {
    format!(
        "error: {}\noriginal_location: {}\nquarantined_at: {}\n",
        error,
        location,
        at.to_rfc3339()
    )
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Copy `source` into a directory under `root` that did not exist before.
/// Returns the directory and the number of files copied.
fn copy_to_fresh_dir(source: &Path, root: &Path, base: &str) -> std::io::Result<(PathBuf, u64)> {
    if !source.is_dir() {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("{} is not a directory", source.display()),
        ));
    }
    std::fs::create_dir_all(root)?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let dest = if attempt == 0 {
            root.join(base)
        } else {
            root.join(format!("{}_{}", base, attempt))
        };
        match std::fs::create_dir(&dest) {
            Ok(()) => {
                let copied = copy_dir(source, &dest)?;
                return Ok((dest, copied));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free quarantine name for {}", base),
    ))
}

/// Recursive copy, returns the number of files copied
fn copy_dir(source: &Path, dest: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
