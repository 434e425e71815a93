//! FaceClient - embedding service adapter
//!
//! ## Responsibilities
//!
//! - `FaceEmbedder` seam used by the processing engine
//! - HTTP implementation: multipart upload of one image, parse faces
//! - Retry transient send failures with exponential backoff
//!
//! The service contract is `embed(image) -> [{bbox, vector}]`. Matching
//! against known employees happens elsewhere (see `employee_registry`).

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Face bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// One face found in an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub bbox: FaceBox,
    #[serde(alias = "embedding")]
    pub vector: Vec<f64>,
}

#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    /// Locate faces in an encoded image and return one embedding per face.
    /// An image without faces yields an empty list, not an error.
    async fn embed(&self, image: &[u8]) -> Result<Vec<FaceEmbedding>>;
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    faces: Vec<FaceEmbedding>,
}

/// Embedding service over HTTP
pub struct HttpFaceEmbedder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl HttpFaceEmbedder {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_retries: 3,
        })
    }

    /// Check embedding service health
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send with retry. The form is consumed by each attempt, so it is
    /// rebuilt from the image bytes every time.
    async fn send_with_retry(&self, url: &str, image: &[u8]) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                tokio::time::sleep(delay).await;
            }

            let form = Form::new().part(
                "image",
                Part::bytes(image.to_vec())
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            );

            match self.client.post(url).multipart(form).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    tracing::debug!(
                        url = %url,
                        status = %resp.status(),
                        attempt,
                        "Embedding service error, retrying"
                    );
                    let status = resp.status();
                    last_error = Some(Error::Embedding(format!("service returned {}", status)));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::debug!(
                        url = %url,
                        error = %e,
                        attempt,
                        "Embedding request failed, retrying"
                    );
                    last_error = Some(Error::Http(e));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Embedding("request failed after retries".to_string())))
    }
}

#[async_trait]
impl FaceEmbedder for HttpFaceEmbedder {
    async fn embed(&self, image: &[u8]) -> Result<Vec<FaceEmbedding>> {
        let url = format!("{}/v1/embed", self.base_url);
        let resp = self.send_with_retry(&url, image).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("{} - {}", status, body)));
        }

        let parsed: EmbedResponse = resp.json().await?;
        if let Some(face) = parsed.faces.iter().find(|f| f.vector.is_empty()) {
            return Err(Error::Embedding(format!("face at {:?} has an empty vector", face.bbox)));
        }
        Ok(parsed.faces)
    }
}
