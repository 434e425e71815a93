//! DetectionLogService - DetectionRecord persistence
//!
//! ## Responsibilities
//!
//! - Persist one detection record per processed batch
//!   (detection_records + detection_entries tables)
//! - Idempotent insert: a record already present for a batch is reported,
//!   not duplicated, so a re-processed batch after stale reclaim is safe
//! - Query interface for reporting

use crate::db::{from_millis, to_millis, Database};
use crate::error::{is_unique_violation, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::AnyPool;
use sqlx::Row;
use tokio::sync::RwLock;

/// Per-employee aggregate within one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeDetection {
    pub employee_id: String,
    pub name: String,
    pub detection_count: u64,
    pub average_confidence: f64,
}

/// Result of processing one batch. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub line_id: String,
    pub batch_location: String,
    pub processor_id: String,
    /// `interval` or `motion`
    pub capture_type: String,
    /// Start of the batch's capture window
    pub captured_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub total_images: u64,
    pub processing_time_seconds: f64,
    pub total_faces_detected: u64,
    pub total_faces_recognized: u64,
    pub total_faces_unknown: u64,
    pub unique_people_recognized: u64,
    pub detections: Vec<EmployeeDetection>,
}

impl DetectionRecord {
    pub fn detection_for(&self, employee_id: &str) -> Option<&EmployeeDetection> {
        self.detections.iter().find(|d| d.employee_id == employee_id)
    }
}

/// Counters of one processing cycle, persisted for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub processor_id: String,
    pub recorded_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stale_reclaimed: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
}

/// Insert result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyRecorded,
}

/// Service counters
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub records_saved: u64,
    pub duplicates_skipped: u64,
}

pub struct DetectionLogService {
    pool: AnyPool,
    stats: RwLock<ServiceStats>,
}

impl DetectionLogService {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            stats: RwLock::new(ServiceStats::default()),
        }
    }

    /// Insert a record and its entries in one transaction
    pub async fn insert(&self, record: &DetectionRecord) -> Result<InsertOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let header = sqlx::query(
            r#"
            INSERT INTO detection_records (
                batch_location, line_id, processor_id, capture_type,
                captured_at, processed_at, total_images, processing_time_seconds,
                total_faces_detected, total_faces_recognized, total_faces_unknown,
                unique_people_recognized
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.batch_location.as_str())
        .bind(record.line_id.as_str())
        .bind(record.processor_id.as_str())
        .bind(record.capture_type.as_str())
        .bind(to_millis(record.captured_at))
        .bind(to_millis(record.processed_at))
        .bind(record.total_images as i64)
        .bind(record.processing_time_seconds)
        .bind(record.total_faces_detected as i64)
        .bind(record.total_faces_recognized as i64)
        .bind(record.total_faces_unknown as i64)
        .bind(record.unique_people_recognized as i64)
        .execute(&mut *tx)
        .await;

        if let Err(e) = header {
            if is_unique_violation(&e) {
                let _ = tx.rollback().await;
                self.stats.write().await.duplicates_skipped += 1;
                tracing::warn!(
                    batch_location = %record.batch_location,
                    "Detection record already present, skipping insert"
                );
                return Ok(InsertOutcome::AlreadyRecorded);
            }
            return Err(Error::Database(e.to_string()));
        }

        for entry in &record.detections {
            sqlx::query(
                r#"
                INSERT INTO detection_entries (
                    batch_location, employee_id, name, detection_count, average_confidence
                ) VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.batch_location.as_str())
            .bind(entry.employee_id.as_str())
            .bind(entry.name.as_str())
            .bind(entry.detection_count as i64)
            .bind(entry.average_confidence)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        self.stats.write().await.records_saved += 1;

        tracing::info!(
            line_id = %record.line_id,
            batch_location = %record.batch_location,
            total_images = record.total_images,
            faces_detected = record.total_faces_detected,
            faces_recognized = record.total_faces_recognized,
            unique_people = record.unique_people_recognized,
            "Detection record saved"
        );
        Ok(InsertOutcome::Inserted)
    }

    pub async fn get(&self, batch_location: &str) -> Result<Option<DetectionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT batch_location, line_id, processor_id, capture_type, captured_at,
                   processed_at, total_images, processing_time_seconds,
                   total_faces_detected, total_faces_recognized, total_faces_unknown,
                   unique_people_recognized
            FROM detection_records
            WHERE batch_location = ?
            "#,
        )
        .bind(batch_location)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let mut record = row_to_record(&row)?;
                record.detections = self.entries(batch_location).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Most recent records of a line, newest first (entries included)
    pub async fn get_by_line(&self, line_id: &str, limit: u32) -> Result<Vec<DetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_location, line_id, processor_id, capture_type, captured_at,
                   processed_at, total_images, processing_time_seconds,
                   total_faces_detected, total_faces_recognized, total_faces_unknown,
                   unique_people_recognized
            FROM detection_records
            WHERE line_id = ?
            ORDER BY processed_at DESC
            LIMIT ?
            "#,
        )
        .bind(line_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = row_to_record(row)?;
            record.detections = self.entries(&record.batch_location).await?;
            records.push(record);
        }
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM detection_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let n: i64 = row.try_get("n").map_err(|e| Error::Database(e.to_string()))?;
        Ok(n.max(0) as u64)
    }

    pub async fn record_cycle(&self, metrics: &CycleMetrics) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_metrics (
                processor_id, recorded_at, elapsed_ms, stale_reclaimed,
                claimed, completed, failed, released
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metrics.processor_id.as_str())
        .bind(to_millis(metrics.recorded_at))
        .bind(metrics.elapsed_ms as i64)
        .bind(metrics.stale_reclaimed as i64)
        .bind(metrics.claimed as i64)
        .bind(metrics.completed as i64)
        .bind(metrics.failed as i64)
        .bind(metrics.released as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Cycle metrics recorded since `since`, oldest first
    pub async fn cycles_since(&self, since: DateTime<Utc>) -> Result<Vec<CycleMetrics>> {
        let rows = sqlx::query(
            r#"
            SELECT processor_id, recorded_at, elapsed_ms, stale_reclaimed,
                   claimed, completed, failed, released
            FROM cycle_metrics
            WHERE recorded_at >= ?
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let map = |e: sqlx::Error| Error::Database(e.to_string());
                let count = |col: &str| -> Result<u64> {
                    let v: i64 = row.try_get(col).map_err(map)?;
                    Ok(v.max(0) as u64)
                };
                Ok(CycleMetrics {
                    processor_id: row.try_get("processor_id").map_err(map)?,
                    recorded_at: from_millis(row.try_get("recorded_at").map_err(map)?),
                    elapsed_ms: count("elapsed_ms")?,
                    stale_reclaimed: count("stale_reclaimed")?,
                    claimed: count("claimed")?,
                    completed: count("completed")?,
                    failed: count("failed")?,
                    released: count("released")?,
                })
            })
            .collect()
    }

    pub async fn get_stats(&self) -> ServiceStats {
        self.stats.read().await.clone()
    }

    async fn entries(&self, batch_location: &str) -> Result<Vec<EmployeeDetection>> {
        let rows = sqlx::query(
            r#"
            SELECT employee_id, name, detection_count, average_confidence
            FROM detection_entries
            WHERE batch_location = ?
            ORDER BY detection_count DESC, employee_id ASC
            "#,
        )
        .bind(batch_location)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let map = |e: sqlx::Error| Error::Database(e.to_string());
                let count: i64 = row.try_get("detection_count").map_err(map)?;
                Ok(EmployeeDetection {
                    employee_id: row.try_get("employee_id").map_err(map)?,
                    name: row.try_get("name").map_err(map)?,
                    detection_count: count.max(0) as u64,
                    average_confidence: row.try_get("average_confidence").map_err(map)?,
                })
            })
            .collect()
    }
}

fn row_to_record(row: &AnyRow) -> Result<DetectionRecord> {
    let map = |e: sqlx::Error| Error::Database(e.to_string());
    let count = |col: &str| -> Result<u64> {
        let v: i64 = row.try_get(col).map_err(map)?;
        Ok(v.max(0) as u64)
    };

    Ok(DetectionRecord {
        batch_location: row.try_get("batch_location").map_err(map)?,
        line_id: row.try_get("line_id").map_err(map)?,
        processor_id: row.try_get("processor_id").map_err(map)?,
        capture_type: row.try_get("capture_type").map_err(map)?,
        captured_at: from_millis(row.try_get("captured_at").map_err(map)?),
        processed_at: from_millis(row.try_get("processed_at").map_err(map)?),
        total_images: count("total_images")?,
        processing_time_seconds: row.try_get("processing_time_seconds").map_err(map)?,
        total_faces_detected: count("total_faces_detected")?,
        total_faces_recognized: count("total_faces_recognized")?,
        total_faces_unknown: count("total_faces_unknown")?,
        unique_people_recognized: count("unique_people_recognized")?,
        detections: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(location: &str) -> DetectionRecord {
        let at = from_millis(1_700_000_000_000);
        DetectionRecord {
            line_id: "L1".into(),
            batch_location: location.into(),
            processor_id: "proc-a".into(),
            capture_type: "interval".into(),
            captured_at: at,
            processed_at: at,
            total_images: 12,
            processing_time_seconds: 1.5,
            total_faces_detected: 4,
            total_faces_recognized: 3,
            total_faces_unknown: 1,
            unique_people_recognized: 1,
            detections: vec![EmployeeDetection {
                employee_id: "E1".into(),
                name: "Alice".into(),
                detection_count: 3,
                average_confidence: 0.8,
            }],
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = Database::in_memory().await.unwrap();
        let service = DetectionLogService::new(&db);
        let record = sample("/f/L1/20240101_1200");

        assert_eq!(service.insert(&record).await.unwrap(), InsertOutcome::Inserted);
        let loaded = service.get("/f/L1/20240101_1200").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.detection_for("E1").unwrap().detection_count, 3);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let service = DetectionLogService::new(&db);
        let record = sample("/f/dup");

        service.insert(&record).await.unwrap();
        assert_eq!(
            service.insert(&record).await.unwrap(),
            InsertOutcome::AlreadyRecorded
        );
        assert_eq!(service.count().await.unwrap(), 1);

        let stats = service.get_stats().await;
        assert_eq!(stats.records_saved, 1);
        assert_eq!(stats.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_get_by_line() {
        let db = Database::in_memory().await.unwrap();
        let service = DetectionLogService::new(&db);
        service.insert(&sample("/f/a")).await.unwrap();
        let mut other = sample("/f/b");
        other.line_id = "L2".into();
        service.insert(&other).await.unwrap();

        let l1 = service.get_by_line("L1", 10).await.unwrap();
        assert_eq!(l1.len(), 1);
        assert_eq!(l1[0].detections.len(), 1);
        assert!(service.get("/f/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_metrics_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let service = DetectionLogService::new(&db);
        let metrics = CycleMetrics {
            processor_id: "proc-a".into(),
            recorded_at: from_millis(1_700_000_000_000),
            elapsed_ms: 420,
            stale_reclaimed: 1,
            claimed: 3,
            completed: 2,
            failed: 1,
            released: 0,
        };
        service.record_cycle(&metrics).await.unwrap();

        let since = service.cycles_since(from_millis(1_699_999_999_000)).await.unwrap();
        assert_eq!(since, vec![metrics]);
        assert!(service
            .cycles_since(from_millis(1_700_000_001_000))
            .await
            .unwrap()
            .is_empty());
    }
}
