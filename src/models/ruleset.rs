use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing mandatory field '{0}'")]
    MissingField(&'static str),
    #[error("Duplicate {kind} name '{name}' in ruleset")]
    DuplicateName { kind: &'static str, name: String },
    #[error("Ruleset has no bound resources to monitor")]
    NoResources,
}

/// Identity of a ruleset: unique per `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RulesetKey {
    pub owner: String,
    pub name: String,
}

/// A named bundle of metric resources and boolean rules evaluated together,
/// owned by the trigger engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A handle to an external metric stream identified by
/// `(monitorer, identifier)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub monitorer: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<ResourceHistory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHistory {
    pub last_metrics: BTreeMap<String, serde_json::Value>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<RuleHistory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHistory {
    pub last_result: bool,
    pub date: DateTime<Utc>,
}

impl Ruleset {
    pub fn key(&self) -> RulesetKey {
        RulesetKey {
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }

    /// Check mandatory fields and name uniqueness. `require_resources` is
    /// enforced when registering (a ruleset without resources can never
    /// fire) but not for a pure compute call carrying inline histories.
    pub fn validate(&self, require_resources: bool) -> Result<(), ValidationError> {
        if self.owner.is_empty() {
            return Err(ValidationError::MissingField("owner"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if require_resources && self.resources.is_empty() {
            return Err(ValidationError::NoResources);
        }

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(ValidationError::MissingField("resources.name"));
            }
            if resource.monitorer.is_empty() {
                return Err(ValidationError::MissingField("resources.monitorer"));
            }
            if resource.identifier.is_empty() {
                return Err(ValidationError::MissingField("resources.identifier"));
            }
            if !seen.insert(resource.name.clone()) {
                return Err(ValidationError::DuplicateName {
                    kind: "resource",
                    name: resource.name.clone(),
                });
            }
        }

        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(ValidationError::MissingField("rules.name"));
            }
            if rule.expression.is_empty() {
                return Err(ValidationError::MissingField("rules.expression"));
            }
            if !seen.insert(rule.name.clone()) {
                return Err(ValidationError::DuplicateName {
                    kind: "rule",
                    name: rule.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ruleset {
        Ruleset {
            owner: "overseer".to_string(),
            name: "stable_producer".to_string(),
            resources: vec![Resource {
                name: "rmq".to_string(),
                monitorer: "monitorer_rabbitmq".to_string(),
                identifier: "rpc-producer".to_string(),
                history: None,
            }],
            rules: vec![Rule {
                name: "latency_ok".to_string(),
                expression: "rmq:latency < 0.200".to_string(),
                history: None,
            }],
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate(true).is_ok());
    }

    #[test]
    fn test_validate_missing_owner() {
        let mut ruleset = sample();
        ruleset.owner = String::new();
        assert!(matches!(
            ruleset.validate(true),
            Err(ValidationError::MissingField("owner"))
        ));
    }

    #[test]
    fn test_validate_no_resources() {
        let mut ruleset = sample();
        ruleset.resources.clear();
        assert!(matches!(
            ruleset.validate(true),
            Err(ValidationError::NoResources)
        ));
        // a pure compute call may omit resources
        assert!(ruleset.validate(false).is_ok());
    }

    #[test]
    fn test_validate_duplicate_rule() {
        let mut ruleset = sample();
        ruleset.rules.push(ruleset.rules[0].clone());
        assert!(matches!(
            ruleset.validate(true),
            Err(ValidationError::DuplicateName { kind: "rule", .. })
        ));
    }
}
