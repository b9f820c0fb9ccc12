//! Container-platform adapter seam.
//!
//! The swarm adapter itself is an external collaborator; this module fixes
//! the RPC surface the orchestrator consumes, the data shape the platform
//! reports for a service, and the deadline/retry policy applied to every
//! outbound call.

use crate::models::{ImageVersion, ScaleConfig, ServiceMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("Platform call '{call}' failed: {message}")]
    Unavailable { call: String, message: String },

    #[error("Platform call '{call}' exceeded its deadline")]
    Deadline { call: String },

    #[error("Platform returned an invalid payload for '{call}': {message}")]
    Invalid { call: String, message: String },
}

impl PlatformError {
    pub fn kind(&self) -> &'static str {
        "PlatformError"
    }
}

/// Raw service state as reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub name: String,
    pub full_image_id: String,
    pub image: String,
    pub tag: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub mode: ServiceMode,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl ServiceData {
    pub fn image_version(&self) -> ImageVersion {
        ImageVersion::from_tag(&self.repository, &self.image, &self.tag, self.digest.as_deref())
    }
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn get(&self, service_name: &str) -> Result<ServiceData, PlatformError>;

    async fn list_services(&self) -> Result<Vec<ServiceData>, PlatformError>;

    /// Update a service's image and/or replica count.
    async fn update(
        &self,
        service_name: &str,
        image_id: Option<&str>,
        scale: Option<u64>,
    ) -> Result<(), PlatformError>;

    /// Fetch the self-description published by an image, if it has one.
    async fn fetch_image_config(
        &self,
        full_image_id: &str,
    ) -> Result<Option<ScaleConfig>, PlatformError>;
}

/// Run `call` under `deadline`, retrying once with backoff when it fails.
/// Retriable by construction: every platform write is an idempotent upsert.
pub async fn with_retry<T, F, Fut>(
    name: &str,
    deadline: Duration,
    call: F,
) -> Result<T, PlatformError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    match tokio::time::timeout(deadline, call()).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(error)) => warn!("platform call '{}' failed, retrying: {}", name, error),
        Err(_) => warn!("platform call '{}' timed out, retrying", name),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    match tokio::time::timeout(deadline, call()).await {
        Ok(result) => result,
        Err(_) => Err(PlatformError::Deadline {
            call: name.to_string(),
        }),
    }
}

/// HTTP client for a platform adapter exposing the RPC surface above.
pub struct RestPlatform {
    base_url: String,
    client: reqwest::Client,
    deadline: Duration,
}

impl RestPlatform {
    pub fn new(base_url: &str, deadline: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            deadline,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        call: &str,
        url: String,
    ) -> Result<T, PlatformError> {
        with_retry(call, self.deadline, || async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| PlatformError::Unavailable {
                    call: call.to_string(),
                    message: e.to_string(),
                })?;
            response
                .error_for_status()
                .map_err(|e| PlatformError::Unavailable {
                    call: call.to_string(),
                    message: e.to_string(),
                })?
                .json()
                .await
                .map_err(|e| PlatformError::Invalid {
                    call: call.to_string(),
                    message: e.to_string(),
                })
        })
        .await
    }
}

#[async_trait]
impl PlatformAdapter for RestPlatform {
    async fn get(&self, service_name: &str) -> Result<ServiceData, PlatformError> {
        self.get_json("get", format!("{}/services/{}", self.base_url, service_name))
            .await
    }

    async fn list_services(&self) -> Result<Vec<ServiceData>, PlatformError> {
        self.get_json("list_services", format!("{}/services", self.base_url))
            .await
    }

    async fn update(
        &self,
        service_name: &str,
        image_id: Option<&str>,
        scale: Option<u64>,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/services/{}/update", self.base_url, service_name);
        let body = serde_json::json!({ "image_id": image_id, "scale": scale });
        with_retry("update", self.deadline, || async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| PlatformError::Unavailable {
                    call: "update".to_string(),
                    message: e.to_string(),
                })?
                .error_for_status()
                .map_err(|e| PlatformError::Unavailable {
                    call: "update".to_string(),
                    message: e.to_string(),
                })?;
            Ok(())
        })
        .await
    }

    async fn fetch_image_config(
        &self,
        full_image_id: &str,
    ) -> Result<Option<ScaleConfig>, PlatformError> {
        let url = format!("{}/images/config", self.base_url);
        let body = serde_json::json!({ "full_image_id": full_image_id });
        with_retry("fetch_image_config", self.deadline, || async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| PlatformError::Unavailable {
                    call: "fetch_image_config".to_string(),
                    message: e.to_string(),
                })?
                .error_for_status()
                .map_err(|e| PlatformError::Unavailable {
                    call: "fetch_image_config".to_string(),
                    message: e.to_string(),
                })?
                .json()
                .await
                .map_err(|e| PlatformError::Invalid {
                    call: "fetch_image_config".to_string(),
                    message: e.to_string(),
                })
        })
        .await
    }
}
