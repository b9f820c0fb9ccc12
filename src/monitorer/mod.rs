//! Metric-collector seam.
//!
//! Monitorers are external services that watch a queue (or any other metric
//! source) and publish `metrics_updated` samples. The trigger engine only
//! ever calls `track` on them, once per registered resource.

use crate::platform::{PlatformError, with_retry};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait MonitorerClient: Send + Sync {
    /// Ask the named monitorer to start tracking an identifier (a queue
    /// name, usually). Idempotent on the monitorer side.
    async fn track(&self, monitorer: &str, identifier: &str) -> Result<(), PlatformError>;
}

/// HTTP client for monitorers exposing `POST /{monitorer}/track`.
pub struct RestMonitorer {
    base_url: String,
    client: reqwest::Client,
    deadline: Duration,
}

impl RestMonitorer {
    pub fn new(base_url: &str, deadline: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            deadline,
        }
    }
}

#[async_trait]
impl MonitorerClient for RestMonitorer {
    async fn track(&self, monitorer: &str, identifier: &str) -> Result<(), PlatformError> {
        let url = format!("{}/{}/track", self.base_url, monitorer);
        let body = serde_json::json!({ "identifier": identifier });
        with_retry("track", self.deadline, || async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| PlatformError::Unavailable {
                    call: "track".to_string(),
                    message: e.to_string(),
                })?
                .error_for_status()
                .map_err(|e| PlatformError::Unavailable {
                    call: "track".to_string(),
                    message: e.to_string(),
                })?;
            Ok(())
        })
        .await
    }
}
