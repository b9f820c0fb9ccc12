//! Load controller.
//!
//! Turns trigger outputs into scale commands. For every monitored service it
//! registers a derived ruleset (user rules plus the reserved
//! `__scale_up__`/`__scale_down__` rules), listens for `ruleset_triggered`
//! and asks the orchestrator to rescale within the service's bounds.

use crate::bus::Event;
use crate::metrics::{SCALE_OPERATIONS_TOTAL, SWEEP_REEXECUTIONS_TOTAL};
use crate::models::{
    Resource, Rule, Ruleset, RulesetKey, ScaleConfig, ScaleSpec, Service, ServiceDiff, ServiceMode,
};
use crate::orchestrator::{Orchestrator, clamp_scale};
use crate::store::Collection;
use crate::trigger::{TriggerEngine, TriggerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const SCALE_UP_RULE: &str = "__scale_up__";
pub const SCALE_DOWN_RULE: &str = "__scale_down__";

/// The load controller's own record of a monitored service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRecord {
    pub name: String,
    pub mode: ServiceMode,
    pub scale_config: Option<ScaleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ruleset: Option<LatestRuleset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestRuleset {
    pub date: DateTime<Utc>,
    pub rule: BTreeMap<String, bool>,
}

pub struct LoadController {
    /// identity used as ruleset owner
    name: String,
    services: Collection<String, LoadRecord>,
    trigger: Arc<TriggerEngine>,
    orchestrator: Arc<Orchestrator>,
    sweep_interval: Duration,
    stale_after: chrono::Duration,
}

impl LoadController {
    pub fn new(
        trigger: Arc<TriggerEngine>,
        orchestrator: Arc<Orchestrator>,
        sweep_interval: Duration,
        stale_after_seconds: i64,
    ) -> Self {
        Self {
            name: "load_manager".to_string(),
            services: Collection::new("load_services"),
            trigger,
            orchestrator,
            sweep_interval,
            stale_after: chrono::Duration::seconds(stale_after_seconds),
        }
    }

    pub fn owner(&self) -> &str {
        &self.name
    }

    /// Event loop plus the periodic safety-net sweep.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        info!("Load controller started");
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Event::RulesetTriggered { ruleset, rules_stats } => {
                            self.on_ruleset_triggered(&ruleset, rules_stats).await;
                        }
                        Event::ServiceUpdated { service, diff } => {
                            self.on_service_updated(&service, &diff).await;
                        }
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    self.recheck_rules().await;
                }
            }
        }
        warn!("Load controller mailbox closed");
    }

    // ####################################################
    //  RPC surface
    // ####################################################

    /// Start managing a service's scale: store the record and register its
    /// trigger ruleset. The ruleset is dry-run first; a ruleset that cannot
    /// compute is not registered.
    pub async fn monitor_service(&self, service: &Service) -> Result<(), TriggerError> {
        self.services
            .upsert(
                service.name.clone(),
                LoadRecord {
                    name: service.name.clone(),
                    mode: service.mode.clone(),
                    scale_config: service.scale_config.clone(),
                    latest_ruleset: None,
                },
            )
            .await;

        let Some(config) = &service.scale_config else {
            debug!("service {} has no scale_config, nothing to trigger on", service.name);
            return Ok(());
        };
        self.register_trigger_rules(&service.name, &config.scale)
            .await
    }

    pub async fn unmonitor_service(&self, service_name: &str) {
        self.services.remove(&service_name.to_string()).await;
        self.trigger.delete(&self.name, service_name).await;
    }

    pub async fn list_services(&self) -> Vec<LoadRecord> {
        self.services.list().await
    }

    // ####################################################
    //  Event handling
    // ####################################################

    pub async fn on_ruleset_triggered(
        &self,
        ruleset: &RulesetKey,
        rules_stats: BTreeMap<String, bool>,
    ) {
        if ruleset.owner != self.name {
            return;
        }
        let Some(record) = self.services.get(&ruleset.name).await else {
            return;
        };
        self.execute_ruleset(rules_stats, &record).await;
    }

    /// Keep our mode/scale_config copies in sync with the orchestrator's
    /// diffs; a scale_config change re-registers the trigger ruleset. A
    /// fresh service (empty diff) with scaling rules is onboarded.
    pub async fn on_service_updated(&self, service: &Service, diff: &ServiceDiff) {
        let known = self.services.contains(&service.name).await;
        if !known {
            let has_rules = service
                .scale_config
                .as_ref()
                .is_some_and(|config| !config.scale.resources.is_empty());
            if diff.is_empty() && has_rules {
                if let Err(e) = self.monitor_service(service).await {
                    error!("can't monitor fresh service {}: {}", service.name, e);
                }
            }
            return;
        }

        if diff.scale.is_some() || diff.mode.is_some() {
            self.services
                .update(&service.name, |record| {
                    record.mode = service.mode.clone();
                })
                .await;
        }
        if let Some(new_config) = &diff.scale_config {
            self.services
                .update(&service.name, |record| {
                    record.scale_config = Some(new_config.clone());
                })
                .await;
            if let Err(e) = self
                .register_trigger_rules(&service.name, &new_config.scale)
                .await
            {
                error!("can't refresh trigger rules for {}: {}", service.name, e);
            }
        }
    }

    /// Safety net against lost events: re-execute rulesets that still ask
    /// for scaling but whose latest result is stale.
    pub async fn recheck_rules(&self) {
        let now = Utc::now();
        for record in self.services.list().await {
            let Some(latest) = &record.latest_ruleset else {
                continue;
            };
            let wants_scaling = latest.rule.get(SCALE_UP_RULE).copied().unwrap_or(false)
                || latest.rule.get(SCALE_DOWN_RULE).copied().unwrap_or(false);
            if wants_scaling && now - latest.date > self.stale_after {
                SWEEP_REEXECUTIONS_TOTAL.inc();
                self.execute_ruleset(latest.rule.clone(), &record).await;
            }
        }
    }

    // ####################################################
    //  Private
    // ####################################################

    async fn execute_ruleset(&self, rules_stats: BTreeMap<String, bool>, record: &LoadRecord) {
        self.services
            .update(&record.name, |stored| {
                stored.latest_ruleset = Some(LatestRuleset {
                    date: Utc::now(),
                    rule: rules_stats.clone(),
                });
            })
            .await;

        let delta = scale_delta(&rules_stats);
        let Some((current, best)) =
            clamp_scale(&record.mode, record.scale_config.as_ref(), delta)
        else {
            return;
        };
        if current == best {
            debug!(
                "asked delta of {} for {}: best scale still is {}",
                delta, record.name, current
            );
            return;
        }

        info!("rules triggered new scale for {}: {} => {}", record.name, current, best);
        SCALE_OPERATIONS_TOTAL.inc();
        if let Err(e) = self.orchestrator.scale(&record.name, best).await {
            error!("can't scale {} to {}: {}", record.name, best, e);
        }
    }

    async fn register_trigger_rules(
        &self,
        service_name: &str,
        scale_spec: &ScaleSpec,
    ) -> Result<(), TriggerError> {
        let ruleset = build_trigger_ruleset(&self.name, service_name, scale_spec);
        if let Err(e) = TriggerEngine::compute(&ruleset) {
            error!("impossible to add the ruleset for {}: {}", service_name, e);
            return Err(e);
        }
        self.trigger.add(ruleset).await
    }
}

/// Delta requested by a ruleset result: up wins over down.
pub fn scale_delta(rules_stats: &BTreeMap<String, bool>) -> i64 {
    if rules_stats.get(SCALE_UP_RULE).copied().unwrap_or(false) {
        1
    } else if rules_stats.get(SCALE_DOWN_RULE).copied().unwrap_or(false) {
        -1
    } else {
        0
    }
}

/// Derive the trigger ruleset for a service: user rules (reserved names
/// dropped with a warning) plus the injected scale_up/scale_down rules.
pub fn build_trigger_ruleset(owner: &str, service_name: &str, spec: &ScaleSpec) -> Ruleset {
    let mut rules = Vec::new();
    for rule in &spec.rules {
        if rule.name == SCALE_UP_RULE || rule.name == SCALE_DOWN_RULE {
            warn!(
                "scale_config contains reserved rule name {}, this one is ignored",
                rule.name
            );
            continue;
        }
        rules.push(Rule {
            name: rule.name.clone(),
            expression: rule.expression.clone(),
            history: None,
        });
    }
    if let Some(scale_up) = &spec.scale_up {
        rules.push(Rule {
            name: SCALE_UP_RULE.to_string(),
            expression: scale_up.clone(),
            history: None,
        });
    }
    if let Some(scale_down) = &spec.scale_down {
        rules.push(Rule {
            name: SCALE_DOWN_RULE.to_string(),
            expression: scale_down.clone(),
            history: None,
        });
    }

    Ruleset {
        owner: owner.to_string(),
        name: service_name.to_string(),
        resources: spec
            .resources
            .iter()
            .map(|resource| Resource {
                name: resource.name.clone(),
                monitorer: resource.monitorer.clone(),
                identifier: resource.identifier.clone(),
                history: None,
            })
            .collect(),
        rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceSpec, RuleSpec};

    fn spec() -> ScaleSpec {
        ScaleSpec {
            resources: vec![ResourceSpec {
                name: "rmq".to_string(),
                monitorer: "monitorer_rabbitmq".to_string(),
                identifier: "rpc-producer".to_string(),
            }],
            rules: vec![
                RuleSpec {
                    name: "panic".to_string(),
                    expression: "rmq:latency > 10".to_string(),
                },
                RuleSpec {
                    name: SCALE_UP_RULE.to_string(),
                    expression: "true".to_string(),
                },
            ],
            scale_up: Some("rules:panic".to_string()),
            scale_down: Some("rules:stable".to_string()),
        }
    }

    #[test]
    fn test_build_ruleset_injects_reserved_rules() {
        let ruleset = build_trigger_ruleset("load_manager", "producer", &spec());
        assert_eq!(ruleset.owner, "load_manager");
        assert_eq!(ruleset.name, "producer");

        let names: Vec<&str> = ruleset.rules.iter().map(|r| r.name.as_str()).collect();
        // the user-provided reserved rule is dropped, the derived ones win
        assert_eq!(names, vec!["panic", SCALE_UP_RULE, SCALE_DOWN_RULE]);
        assert_eq!(
            ruleset.rules.last().unwrap().expression,
            "rules:stable".to_string()
        );
        assert_eq!(ruleset.resources.len(), 1);
    }

    #[test]
    fn test_scale_delta() {
        let mut stats = BTreeMap::new();
        assert_eq!(scale_delta(&stats), 0);

        stats.insert(SCALE_DOWN_RULE.to_string(), true);
        assert_eq!(scale_delta(&stats), -1);

        stats.insert(SCALE_UP_RULE.to_string(), true);
        assert_eq!(scale_delta(&stats), 1);
    }
}
