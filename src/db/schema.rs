//! Table definitions. Timestamps are epoch milliseconds.

use super::Backend;

const BATCHES: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    location VARCHAR(512) NOT NULL PRIMARY KEY,
    line_id VARCHAR(64) NOT NULL,
    status VARCHAR(16) NOT NULL,
    created_at BIGINT NOT NULL,
    claimed_at BIGINT NULL,
    processor_id VARCHAR(128) NULL,
    processed_at BIGINT NULL,
    error_message VARCHAR(2048) NULL
)
"#;

const DETECTION_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS detection_records (
    batch_location VARCHAR(512) NOT NULL PRIMARY KEY,
    line_id VARCHAR(64) NOT NULL,
    processor_id VARCHAR(128) NOT NULL,
    capture_type VARCHAR(16) NOT NULL,
    captured_at BIGINT NOT NULL,
    processed_at BIGINT NOT NULL,
    total_images BIGINT NOT NULL,
    processing_time_seconds DOUBLE PRECISION NOT NULL,
    total_faces_detected BIGINT NOT NULL,
    total_faces_recognized BIGINT NOT NULL,
    total_faces_unknown BIGINT NOT NULL,
    unique_people_recognized BIGINT NOT NULL
)
"#;

const DETECTION_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS detection_entries (
    batch_location VARCHAR(512) NOT NULL,
    employee_id VARCHAR(64) NOT NULL,
    name VARCHAR(255) NOT NULL,
    detection_count BIGINT NOT NULL,
    average_confidence DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (batch_location, employee_id)
)
"#;

const EMPLOYEES: &str = r#"
CREATE TABLE IF NOT EXISTS employees (
    employee_id VARCHAR(64) NOT NULL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    embedding VARCHAR(12000) NOT NULL,
    active BIGINT NOT NULL DEFAULT 1
)
"#;

const CYCLE_METRICS: &str = r#"
CREATE TABLE IF NOT EXISTS cycle_metrics (
    processor_id VARCHAR(128) NOT NULL,
    recorded_at BIGINT NOT NULL,
    elapsed_ms BIGINT NOT NULL,
    stale_reclaimed BIGINT NOT NULL,
    claimed BIGINT NOT NULL,
    completed BIGINT NOT NULL,
    failed BIGINT NOT NULL,
    released BIGINT NOT NULL
)
"#;

const SQLITE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_batches_line_status ON batches (line_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_batches_created ON batches (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_detections_line_time \
     ON detection_records (line_id, processed_at)",
    "CREATE INDEX IF NOT EXISTS idx_cycle_metrics_time ON cycle_metrics (recorded_at)",
];

// MySQL has no CREATE INDEX IF NOT EXISTS, so indexes are created inline on
// first table creation instead.
const MYSQL_BATCHES: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    location VARCHAR(512) NOT NULL PRIMARY KEY,
    line_id VARCHAR(64) NOT NULL,
    status VARCHAR(16) NOT NULL,
    created_at BIGINT NOT NULL,
    claimed_at BIGINT NULL,
    processor_id VARCHAR(128) NULL,
    processed_at BIGINT NULL,
    error_message VARCHAR(2048) NULL,
    INDEX idx_batches_line_status (line_id, status),
    INDEX idx_batches_created (created_at)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const MYSQL_DETECTION_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS detection_records (
    batch_location VARCHAR(512) NOT NULL PRIMARY KEY,
    line_id VARCHAR(64) NOT NULL,
    processor_id VARCHAR(128) NOT NULL,
    capture_type VARCHAR(16) NOT NULL,
    captured_at BIGINT NOT NULL,
    processed_at BIGINT NOT NULL,
    total_images BIGINT NOT NULL,
    processing_time_seconds DOUBLE NOT NULL,
    total_faces_detected BIGINT NOT NULL,
    total_faces_recognized BIGINT NOT NULL,
    total_faces_unknown BIGINT NOT NULL,
    unique_people_recognized BIGINT NOT NULL,
    INDEX idx_detections_line_time (line_id, processed_at)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const MYSQL_CYCLE_METRICS: &str = r#"
CREATE TABLE IF NOT EXISTS cycle_metrics (
    processor_id VARCHAR(128) NOT NULL,
    recorded_at BIGINT NOT NULL,
    elapsed_ms BIGINT NOT NULL,
    stale_reclaimed BIGINT NOT NULL,
    claimed BIGINT NOT NULL,
    completed BIGINT NOT NULL,
    failed BIGINT NOT NULL,
    released BIGINT NOT NULL,
    INDEX idx_cycle_metrics_time (recorded_at)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

pub(super) fn statements(backend: Backend) -> Vec<&'static str> {
    match backend {
        Backend::Sqlite => {
            let mut all = vec![
                BATCHES,
                DETECTION_RECORDS,
                DETECTION_ENTRIES,
                EMPLOYEES,
                CYCLE_METRICS,
            ];
            all.extend(SQLITE_INDEXES);
            all
        }
        Backend::MySql => vec![
            MYSQL_BATCHES,
            MYSQL_DETECTION_RECORDS,
            DETECTION_ENTRIES,
            EMPLOYEES,
            MYSQL_CYCLE_METRICS,
        ],
    }
}
