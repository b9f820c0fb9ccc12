use super::image::ImageVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the platform schedules a service's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ServiceMode {
    Replicated { replicas: u64 },
    Global,
    Unknown,
}

impl ServiceMode {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceMode::Replicated { .. } => "replicated",
            ServiceMode::Global => "global",
            ServiceMode::Unknown => "unknown",
        }
    }
}

/// The current image of a service plus the pinned identifier the platform
/// reported for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub info: ImageVersion,
    pub full_image_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// A monitored service record, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: ImageRef,
    pub scale_config: Option<ScaleConfig>,
    pub mode: ServiceMode,
    #[serde(default)]
    pub start_config: StartConfig,
}

/// Self-description published by an image: scaling bounds, trigger rules and
/// inter-service compatibility contracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleConfig {
    #[serde(default)]
    pub min: u64,
    #[serde(default = "default_max")]
    pub max: u64,
    #[serde(default = "default_true")]
    pub auto_update: bool,
    #[serde(default)]
    pub scale: ScaleSpec,
    #[serde(default)]
    pub dependencies: Dependencies,
}

fn default_max() -> u64 {
    99
}

fn default_true() -> bool {
    true
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_max(),
            auto_update: true,
            scale: ScaleSpec::default(),
            dependencies: Dependencies::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleSpec {
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub monitorer: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub expression: String,
}

/// Compatibility contract: symbols this version exports and predicates that
/// must hold against the rest of the fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub provide: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub require: Vec<String>,
}

/// What changed between two observations of the same service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Change<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Change<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Change<ImageVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Change<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_config: Option<ScaleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change<T> {
    pub from: Option<T>,
    pub to: T,
}

impl ServiceDiff {
    pub fn is_empty(&self) -> bool {
        self.scale.is_none()
            && self.mode.is_none()
            && self.image.is_none()
            && self.state.is_none()
            && self.scale_config.is_none()
    }

    /// True when the diff reports a finished platform update, either via the
    /// explicit update state or via a drain to zero replicas.
    pub fn is_completed_update(&self, mode: &ServiceMode) -> bool {
        if let Some(state) = &self.state
            && state.to == "completed"
        {
            return true;
        }
        matches!(mode, ServiceMode::Replicated { replicas: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde() {
        let mode = ServiceMode::Replicated { replicas: 3 };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["name"], "replicated");
        assert_eq!(json["replicas"], 3);

        let back: ServiceMode = serde_json::from_value(json).unwrap();
        assert_eq!(back, mode);

        let global: ServiceMode = serde_json::from_value(serde_json::json!({"name": "global"})).unwrap();
        assert_eq!(global, ServiceMode::Global);
    }

    #[test]
    fn test_scale_config_defaults() {
        let config: ScaleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.min, 0);
        assert_eq!(config.max, 99);
        assert!(config.auto_update);
        assert!(config.scale.resources.is_empty());
    }

    #[test]
    fn test_diff_empty() {
        let diff = ServiceDiff::default();
        assert!(diff.is_empty());

        let diff = ServiceDiff {
            scale: Some(Change {
                from: Some(1),
                to: 2,
            }),
            ..Default::default()
        };
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_completed_update() {
        let diff = ServiceDiff {
            state: Some(Change {
                from: Some("updating".to_string()),
                to: "completed".to_string(),
            }),
            ..Default::default()
        };
        assert!(diff.is_completed_update(&ServiceMode::Replicated { replicas: 3 }));

        let empty = ServiceDiff::default();
        assert!(empty.is_completed_update(&ServiceMode::Replicated { replicas: 0 }));
        assert!(!empty.is_completed_update(&ServiceMode::Replicated { replicas: 2 }));
        assert!(!empty.is_completed_update(&ServiceMode::Global));
    }
}
