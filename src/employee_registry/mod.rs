//! EmployeeRegistry - nearest known face lookup
//!
//! ## Responsibilities
//!
//! - `nearest(vector, tolerance)` over known employee embeddings
//! - In-memory `KnownFaces` (Euclidean distance, smallest wins)
//! - Read-only SQL loader for the `employees` table
//!
//! Registry CRUD lives outside this crate; rows are only read here.

use crate::db::Database;
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::AnyPool;
use sqlx::Row;
use tokio::sync::RwLock;

/// Best match for one face
#[derive(Debug, Clone, PartialEq)]
pub struct EmployeeMatch {
    pub employee_id: String,
    pub name: String,
    pub distance: f64,
}

impl EmployeeMatch {
    /// Match confidence in [0, 1]
    pub fn confidence(&self) -> f64 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

#[async_trait]
pub trait EmployeeRegistry: Send + Sync {
    /// Closest known employee within `tolerance`, if any
    async fn nearest(&self, vector: &[f64], tolerance: f64) -> Result<Option<EmployeeMatch>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub employee_id: String,
    pub name: String,
    pub vector: Vec<f64>,
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct KnownFaces {
    faces: RwLock<Vec<KnownFace>>,
}

impl KnownFaces {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self {
            faces: RwLock::new(faces),
        }
    }

    pub async fn replace(&self, faces: Vec<KnownFace>) {
        *self.faces.write().await = faces;
    }

    pub async fn len(&self) -> usize {
        self.faces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.faces.read().await.is_empty()
    }
}

#[async_trait]
impl EmployeeRegistry for KnownFaces {
    async fn nearest(&self, vector: &[f64], tolerance: f64) -> Result<Option<EmployeeMatch>> {
        let faces = self.faces.read().await;

        let mut best: Option<(&KnownFace, f64)> = None;
        for face in faces.iter() {
            if face.vector.len() != vector.len() {
                continue;
            }
            let distance = euclidean_distance(&face.vector, vector);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((face, distance));
            }
        }

        Ok(best
            .filter(|(_, distance)| *distance <= tolerance)
            .map(|(face, distance)| EmployeeMatch {
                employee_id: face.employee_id.clone(),
                name: face.name.clone(),
                distance,
            }))
    }
}

/// Registry backed by the `employees` table, cached in memory
pub struct SqlEmployeeRegistry {
    pool: AnyPool,
    cache: KnownFaces,
}

impl SqlEmployeeRegistry {
    /// Load active employees
    pub async fn load(db: &Database) -> Result<Self> {
        let registry = Self {
            pool: db.pool().clone(),
            cache: KnownFaces::default(),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Re-read active employees. Rows with an unreadable embedding are skipped.
    pub async fn reload(&self) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT employee_id, name, embedding
            FROM employees
            WHERE active = 1
            ORDER BY employee_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut faces = Vec::with_capacity(rows.len());
        for row in &rows {
            let employee_id: String = row
                .try_get("employee_id")
                .map_err(|e| Error::Database(e.to_string()))?;
            let name: String = row.try_get("name").map_err(|e| Error::Database(e.to_string()))?;
            let raw: String = row
                .try_get("embedding")
                .map_err(|e| Error::Database(e.to_string()))?;

            match serde_json::from_str::<Vec<f64>>(&raw) {
                Ok(vector) if !vector.is_empty() => faces.push(KnownFace {
                    employee_id,
                    name,
                    vector,
                }),
                Ok(_) => {
                    tracing::warn!(
                        employee_id = %employee_id,
                        "Employee has an empty embedding, skipped"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        employee_id = %employee_id,
                        error = %e,
                        "Employee embedding unreadable, skipped"
                    );
                }
            }
        }

        let count = faces.len();
        self.cache.replace(faces).await;
        tracing::info!(count, "Known employees loaded");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.cache.len().await
    }
}

#[async_trait]
impl EmployeeRegistry for SqlEmployeeRegistry {
    async fn nearest(&self, vector: &[f64], tolerance: f64) -> Result<Option<EmployeeMatch>> {
        self.cache.nearest(vector, tolerance).await
    }
}
