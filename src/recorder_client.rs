//! Typed client for the recorder's export HTTP API.
//!
//! Wraps the three endpoints the reconciler needs (list exports, request
//! an export for a camera and time range, delete an export) behind the
//! [`ExportApi`] trait. Every call is retried per [`RetryPolicy::recorder`]
//! before its error is surfaced.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::retry::{with_retry, RetryPolicy};

/// One export request as reported by the recorder.
///
/// The recorder owns these records; the reconciler only ever holds
/// transient copies re-fetched at the start of each cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRecord {
    /// Opaque identifier, unique per export request.
    pub id: String,
    /// Camera the export was cut from.
    pub camera: String,
    /// Recorder-side location of the artifact. The filename encodes the
    /// camera and the exported time range.
    pub video_path: String,
    /// True until the recorder has finished materializing the file.
    #[serde(default)]
    pub in_progress: bool,
    /// Epoch seconds the export was requested, used for staleness checks.
    #[serde(rename = "date", default)]
    pub requested_at: i64,
}

/// Errors from the recorder API layer.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The HTTP request itself failed (network, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The recorder returned a non-2xx status code.
    #[error("recorder API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Operations the reconciler needs from the recorder.
#[async_trait]
pub trait ExportApi: Send + Sync {
    /// All export records the recorder currently tracks.
    async fn list_exports(&self) -> Result<Vec<ExportRecord>, RecorderError>;

    /// Ask the recorder to materialize `[start, end)` for `camera`.
    async fn request_export(&self, camera: &str, start: i64, end: i64)
        -> Result<(), RecorderError>;

    /// Delete an export record (and its artifact) from the recorder.
    async fn delete_export(&self, id: &str) -> Result<(), RecorderError>;

    /// Exports whose artifact the recorder has finished writing.
    async fn list_finished_exports(&self) -> Result<Vec<ExportRecord>, RecorderError> {
        let mut exports = self.list_exports().await?;
        exports.retain(|e| !e.in_progress);
        Ok(exports)
    }
}

/// HTTP client for a single recorder instance.
pub struct RecorderClient {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl RecorderClient {
    /// Create a client for the recorder at `base_url`
    /// (e.g. `http://frigate:5000`). `timeout` applies to each request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RecorderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            policy: RetryPolicy::recorder(),
        })
    }

    /// Ensure the response has a success status code, or turn the status
    /// and body into a [`RecorderError::Api`].
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RecorderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RecorderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ExportApi for RecorderClient {
    async fn list_exports(&self) -> Result<Vec<ExportRecord>, RecorderError> {
        let url = format!("{}/api/exports", self.base_url);

        with_retry(self.policy, "list_exports", || async {
            let response = self.client.get(&url).send().await?;
            let response = Self::ensure_success(response).await?;
            Ok(response.json::<Vec<ExportRecord>>().await?)
        })
        .await
    }

    async fn request_export(
        &self,
        camera: &str,
        start: i64,
        end: i64,
    ) -> Result<(), RecorderError> {
        let url = format!(
            "{}/api/export/{camera}/start/{start}/end/{end}",
            self.base_url
        );
        let body = serde_json::json!({
            "playbook": "realtime",
            "source": "recordings",
        });

        with_retry(self.policy, "request_export", || async {
            let response = self.client.post(&url).json(&body).send().await?;
            let response = Self::ensure_success(response).await?;
            let ack = response.text().await.unwrap_or_default();
            info!(camera, start, end, response = %ack, "export requested");
            Ok(())
        })
        .await
    }

    async fn delete_export(&self, id: &str) -> Result<(), RecorderError> {
        let url = format!("{}/api/export/{id}", self.base_url);

        with_retry(self.policy, "delete_export", || async {
            let response = self.client.delete(&url).send().await?;
            Self::ensure_success(response).await?;
            Ok(())
        })
        .await
    }
}
