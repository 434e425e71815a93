//! Batch lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Batch status. Transitions are monotonic:
/// pending -> processing -> {completed, error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 4] = [
        BatchStatus::Pending,
        BatchStatus::Processing,
        BatchStatus::Completed,
        BatchStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Error)
    }

    /// Forward transitions only. Processing -> Pending is reserved for
    /// release/stale reclaim and is not a status change callers may request.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Processing)
                | (BatchStatus::Pending, BatchStatus::Error)
                | (BatchStatus::Processing, BatchStatus::Completed)
                | (BatchStatus::Processing, BatchStatus::Error)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "error" => Ok(BatchStatus::Error),
            other => Err(crate::Error::Database(format!(
                "unknown batch status '{}'",
                other
            ))),
        }
    }
}

/// One batch row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Storage location of the frames, unique
    pub location: String,
    pub line_id: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processor_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Aggregate view for the metrics log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    /// Mean claim-to-finish seconds over completed batches in the window
    pub avg_processing_seconds: Option<f64>,
    pub completed_in_window: u64,
}

impl ProcessingStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.error
    }

    pub(crate) fn set_count(&mut self, status: BatchStatus, count: u64) {
        match status {
            BatchStatus::Pending => self.pending = count,
            BatchStatus::Processing => self.processing = count,
            BatchStatus::Completed => self.completed = count,
            BatchStatus::Error => self.error = count,
        }
    }
}
