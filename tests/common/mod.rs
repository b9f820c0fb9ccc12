// Common test utilities for integration tests
//
// Mock platform / monitorer / registry implementations plus fixture
// builders shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use bosun::models::{
    Dependencies, ImageRef, ImageVersion, ResourceSpec, RuleSpec, ScaleConfig, ScaleSpec, Service,
    ServiceMode, StartConfig,
};
use bosun::platform::{PlatformAdapter, PlatformError, ServiceData};
use bosun::registry::TagSource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One recorded `update` call on the mock platform.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCall {
    pub service_name: String,
    pub image_id: Option<String>,
    pub scale: Option<u64>,
}

/// In-memory platform adapter: serves predefined service data and records
/// every update call.
#[derive(Default)]
pub struct MockPlatform {
    pub services: Mutex<BTreeMap<String, ServiceData>>,
    pub configs: Mutex<BTreeMap<String, ScaleConfig>>,
    pub updates: Mutex<Vec<UpdateCall>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_service(&self, data: ServiceData) {
        self.services.lock().await.insert(data.name.clone(), data);
    }

    pub async fn insert_config(&self, full_image_id: &str, config: ScaleConfig) {
        self.configs
            .lock()
            .await
            .insert(full_image_id.to_string(), config);
    }

    pub async fn recorded_updates(&self) -> Vec<UpdateCall> {
        self.updates.lock().await.clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockPlatform {
    async fn get(&self, service_name: &str) -> Result<ServiceData, PlatformError> {
        self.services
            .lock()
            .await
            .get(service_name)
            .cloned()
            .ok_or_else(|| PlatformError::Unavailable {
                call: "get".to_string(),
                message: format!("no such service {}", service_name),
            })
    }

    async fn list_services(&self) -> Result<Vec<ServiceData>, PlatformError> {
        Ok(self.services.lock().await.values().cloned().collect())
    }

    async fn update(
        &self,
        service_name: &str,
        image_id: Option<&str>,
        scale: Option<u64>,
    ) -> Result<(), PlatformError> {
        self.updates.lock().await.push(UpdateCall {
            service_name: service_name.to_string(),
            image_id: image_id.map(String::from),
            scale,
        });
        Ok(())
    }

    async fn fetch_image_config(
        &self,
        full_image_id: &str,
    ) -> Result<Option<ScaleConfig>, PlatformError> {
        Ok(self.configs.lock().await.get(full_image_id).cloned())
    }
}

/// Monitorer that records the identifiers it was asked to track.
#[derive(Default)]
pub struct MockMonitorer {
    pub tracked: Mutex<Vec<(String, String)>>,
}

impl MockMonitorer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl bosun::monitorer::MonitorerClient for MockMonitorer {
    async fn track(&self, monitorer: &str, identifier: &str) -> Result<(), PlatformError> {
        self.tracked
            .lock()
            .await
            .push((monitorer.to_string(), identifier.to_string()));
        Ok(())
    }
}

/// Registry stub serving a fixed tag list per image reference.
#[derive(Default)]
pub struct MockRegistry {
    pub tags: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_tags(&self, image: &str, tags: &[&str]) {
        self.tags
            .lock()
            .await
            .insert(image.to_string(), tags.iter().map(|t| t.to_string()).collect());
    }
}

#[async_trait]
impl TagSource for MockRegistry {
    async fn list_tags(&self, image: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.tags.lock().await.get(image).cloned().unwrap_or_default())
    }
}

// ####################################################
//  Fixture builders
// ####################################################

pub fn full_image_id(species: &str, version: &str) -> String {
    format!("localhost:5000/bosun:{}-{}@sha256:{}", species, version, version)
}

/// Platform-side view of a replicated service running `species-version`.
pub fn service_data(species: &str, version: &str, replicas: u64) -> ServiceData {
    ServiceData {
        name: species.to_string(),
        full_image_id: full_image_id(species, version),
        image: "bosun".to_string(),
        tag: format!("{}-{}", species, version),
        repository: "localhost:5000".to_string(),
        digest: Some(format!("sha256:{}", version)),
        mode: ServiceMode::Replicated { replicas },
        envs: BTreeMap::new(),
    }
}

/// Orchestrator-side record of the same service.
pub fn service_record(
    species: &str,
    version: &str,
    replicas: u64,
    scale_config: Option<ScaleConfig>,
) -> Service {
    let tag = format!("{}-{}", species, version);
    Service {
        name: species.to_string(),
        image: ImageRef {
            info: ImageVersion::from_tag(
                "localhost:5000",
                "bosun",
                &tag,
                Some(&format!("sha256:{}", version)),
            ),
            full_image_id: full_image_id(species, version),
        },
        scale_config,
        mode: ServiceMode::Replicated { replicas },
        start_config: StartConfig::default(),
    }
}

/// A scale_config with the canonical latency ruleset.
pub fn scale_config(min: u64, max: u64) -> ScaleConfig {
    ScaleConfig {
        min,
        max,
        auto_update: true,
        scale: ScaleSpec {
            resources: vec![ResourceSpec {
                name: "rmq".to_string(),
                monitorer: "monitorer_rabbitmq".to_string(),
                identifier: "rpc-producer".to_string(),
            }],
            rules: vec![
                RuleSpec {
                    name: "latency_ok".to_string(),
                    expression: "rmq:waiting == 0 or rmq:latency < 0.200".to_string(),
                },
                RuleSpec {
                    name: "latency_fail".to_string(),
                    expression: "rmq:latency > 5".to_string(),
                },
            ],
            scale_up: Some("rules:latency_fail".to_string()),
            scale_down: Some("rules:latency_ok and rmq:consumers > 0".to_string()),
        },
        dependencies: Dependencies::default(),
    }
}

/// A scale_config carrying only a dependency contract.
pub fn dependency_config(
    provide: serde_json::Value,
    require: &[&str],
) -> ScaleConfig {
    ScaleConfig {
        dependencies: Dependencies {
            provide: serde_json::from_value(provide).unwrap(),
            require: require.iter().map(|s| s.to_string()).collect(),
        },
        ..Default::default()
    }
}

/// Docker Hub webhook payload.
pub fn dockerhub_webhook_payload(repo: &str, tag: &str) -> serde_json::Value {
    let parts: Vec<&str> = repo.split('/').collect();
    let (namespace, name) = if parts.len() == 2 {
        (parts[0], parts[1])
    } else {
        ("library", repo)
    };

    serde_json::json!({
        "push_data": {
            "tag": tag
        },
        "repository": {
            "repo_name": repo,
            "namespace": namespace,
            "name": name
        }
    })
}

/// Private registry webhook payload.
pub fn registry_webhook_payload(host: &str, image: &str, tag: &str) -> serde_json::Value {
    serde_json::json!({
        "events": [{
            "action": "push",
            "target": {
                "digest": "sha256:abc123",
                "repository": image,
                "tag": tag
            },
            "request": {"host": host}
        }]
    })
}
