//! BatchStore - persistent batch lifecycle on the shared store
//!
//! ## Responsibilities
//!
//! - Register finalized batches as `pending`
//! - Atomic claim (`pending` -> `processing`) stamped with the processor id
//! - Monotonic, owner-checked status transitions
//! - Stale-lock reclamation for crashed processors
//!
//! ## Design
//!
//! The claim is an optimistic compare-and-set per row, so it needs no
//! transaction isolation guarantees beyond single-row UPDATE atomicity and
//! behaves the same on MySQL and SQLite. Any number of processor instances
//! may share one store; the conditional UPDATE is the only arbiter.

mod types;

pub use types::*;

use crate::db::{from_millis, to_millis, Database};
use crate::error::{is_unique_violation, Error, Result};
use crate::processor::ProcessorInstance;
use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::AnyPool;
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

const BATCH_COLUMNS: &str =
    "location, line_id, status, created_at, claimed_at, processor_id, processed_at, error_message";

/// Batch queue backed by the shared store
pub struct BatchStore {
    pool: AnyPool,
    processor: ProcessorInstance,
}

impl BatchStore {
    pub fn new(db: &Database, processor: ProcessorInstance) -> Self {
        Self {
            pool: db.pool().clone(),
            processor,
        }
    }

    pub fn processor(&self) -> &ProcessorInstance {
        &self.processor
    }

    /// Insert a new batch as pending. A location already present is a conflict.
    pub async fn register_batch(&self, line_id: &str, location: &str) -> Result<Batch> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO batches (location, line_id, status, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(location)
        .bind(line_id)
        .bind(BatchStatus::Pending.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("batch already registered: {}", location))
            } else {
                Error::Database(e.to_string())
            }
        })?;

        tracing::info!(line_id = %line_id, location = %location, "Batch registered");

        Ok(Batch {
            location: location.to_string(),
            line_id: line_id.to_string(),
            status: BatchStatus::Pending,
            created_at: from_millis(to_millis(now)),
            claimed_at: None,
            processor_id: None,
            processed_at: None,
            error_message: None,
        })
    }

    /// Claim up to `limit` pending batches of a line, oldest first.
    ///
    /// Batches another processor wins are silently skipped, so under
    /// contention the result is smaller or empty rather than an error.
    pub async fn claim_pending(&self, line_id: &str, limit: u32) -> Result<Vec<Batch>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM batches
            WHERE line_id = ? AND status = 'pending'
            ORDER BY created_at ASC
            LIMIT ?
            "#,
            BATCH_COLUMNS
        ))
        .bind(line_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let mut batch = row_to_batch(&row)?;
            let now = from_millis(to_millis(Utc::now()));

            let result = sqlx::query(
                r#"
                UPDATE batches
                SET status = 'processing', processor_id = ?, claimed_at = ?
                WHERE location = ? AND status = 'pending'
                "#,
            )
            .bind(self.processor.id())
            .bind(to_millis(now))
            .bind(batch.location.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if result.rows_affected() == 1 {
                batch.status = BatchStatus::Processing;
                batch.processor_id = Some(self.processor.id().to_string());
                batch.claimed_at = Some(now);
                claimed.push(batch);
            } else {
                tracing::debug!(
                    location = %batch.location,
                    processor_id = %self.processor,
                    "Lost claim race"
                );
            }
        }

        if !claimed.is_empty() {
            tracing::info!(
                line_id = %line_id,
                processor_id = %self.processor,
                count = claimed.len(),
                "Batches claimed"
            );
        }
        Ok(claimed)
    }

    /// Move a batch forward. Terminal states stamp `processed_at`; leaving
    /// `processing` requires this processor to still own the claim.
    pub async fn set_status(
        &self,
        location: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = to_millis(Utc::now());
        let owner = self.processor.id();

        let result = match status {
            BatchStatus::Pending => {
                return Err(Error::InvalidTransition(format!(
                    "{}: batches cannot be moved back to pending directly",
                    location
                )));
            }
            BatchStatus::Processing => {
                sqlx::query(
                    r#"
                    UPDATE batches
                    SET status = 'processing', processor_id = ?, claimed_at = ?
                    WHERE location = ? AND status = 'pending'
                    "#,
                )
                .bind(owner)
                .bind(now)
                .bind(location)
                .execute(&self.pool)
                .await
            }
            BatchStatus::Completed => {
                sqlx::query(
                    r#"
                    UPDATE batches
                    SET status = 'completed', processed_at = ?, error_message = NULL
                    WHERE location = ? AND status = 'processing' AND processor_id = ?
                    "#,
                )
                .bind(now)
                .bind(location)
                .bind(owner)
                .execute(&self.pool)
                .await
            }
            BatchStatus::Error => {
                let message = error
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or("unspecified error");
                sqlx::query(
                    r#"
                    UPDATE batches
                    SET status = 'error', processed_at = ?, error_message = ?
                    WHERE location = ?
                      AND (status = 'pending' OR (status = 'processing' AND processor_id = ?))
                    "#,
                )
                .bind(now)
                .bind(truncate(message, 2000))
                .bind(location)
                .bind(owner)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 1 {
            tracing::debug!(location = %location, status = %status, "Batch status updated");
            return Ok(());
        }

        match self.get(location).await? {
            None => Err(Error::NotFound(format!("batch {}", location))),
            Some(current) => Err(Error::InvalidTransition(format!(
                "{}: {} -> {} rejected (owner: {})",
                location,
                current.status,
                status,
                current.processor_id.as_deref().unwrap_or("-")
            ))),
        }
    }

    /// Hand an owned claim back to the queue. Returns false if it was no
    /// longer ours.
    pub async fn release_claim(&self, location: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'pending', processor_id = NULL, claimed_at = NULL
            WHERE location = ? AND status = 'processing' AND processor_id = ?
            "#,
        )
        .bind(location)
        .bind(self.processor.id())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    /// Return batches claimed longer than `lock_timeout` ago to pending
    pub async fn stale_reclaim(&self, lock_timeout: Duration) -> Result<u64> {
        let timeout = chrono::Duration::from_std(lock_timeout)
            .map_err(|e| Error::Validation(format!("lock timeout out of range: {}", e)))?;
        self.stale_reclaim_before(Utc::now() - timeout).await
    }

    /// Return batches claimed before `cutoff` to pending
    pub async fn stale_reclaim_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'pending', processor_id = NULL, claimed_at = NULL
            WHERE status = 'processing' AND claimed_at < ?
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(
                reclaimed,
                cutoff = %cutoff,
                "Reclaimed stale batch claims"
            );
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, location: &str) -> Result<Option<Batch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM batches WHERE location = ?",
            BATCH_COLUMNS
        ))
        .bind(location)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(row_to_batch).transpose()
    }

    /// Batches of a line in one status, oldest first
    pub async fn list(&self, line_id: &str, status: BatchStatus, limit: u32) -> Result<Vec<Batch>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM batches
            WHERE line_id = ? AND status = ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
            BATCH_COLUMNS
        ))
        .bind(line_id)
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(row_to_batch).collect()
    }

    /// Per-status counts plus mean processing time of batches completed since `since`
    pub async fn stats(&self, since: DateTime<Utc>) -> Result<ProcessingStats> {
        let mut stats = ProcessingStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM batches GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| Error::Database(e.to_string()))?;
            let count: i64 = row.try_get("n").map_err(|e| Error::Database(e.to_string()))?;
            stats.set_count(BatchStatus::from_str(&status)?, count.max(0) as u64);
        }

        let durations = sqlx::query(
            r#"
            SELECT claimed_at, processed_at
            FROM batches
            WHERE status = 'completed'
              AND processed_at >= ?
              AND claimed_at IS NOT NULL
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut total_ms = 0i64;
        for row in &durations {
            let claimed: i64 = row
                .try_get("claimed_at")
                .map_err(|e| Error::Database(e.to_string()))?;
            let processed: i64 = row
                .try_get("processed_at")
                .map_err(|e| Error::Database(e.to_string()))?;
            total_ms += (processed - claimed).max(0);
        }
        stats.completed_in_window = durations.len() as u64;
        if !durations.is_empty() {
            stats.avg_processing_seconds =
                Some(total_ms as f64 / durations.len() as f64 / 1000.0);
        }

        Ok(stats)
    }
}

fn row_to_batch(row: &AnyRow) -> Result<Batch> {
    let map = |e: sqlx::Error| Error::Database(e.to_string());

    let status: String = row.try_get("status").map_err(map)?;
    let claimed_at: Option<i64> = row.try_get("claimed_at").map_err(map)?;
    let processed_at: Option<i64> = row.try_get("processed_at").map_err(map)?;

    Ok(Batch {
        location: row.try_get("location").map_err(map)?,
        line_id: row.try_get("line_id").map_err(map)?,
        status: BatchStatus::from_str(&status)?,
        created_at: from_millis(row.try_get("created_at").map_err(map)?),
        claimed_at: claimed_at.map(from_millis),
        processor_id: row.try_get("processor_id").map_err(map)?,
        processed_at: processed_at.map(from_millis),
        error_message: row.try_get("error_message").map_err(map)?,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
