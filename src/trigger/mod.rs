//! Trigger engine.
//!
//! Owns rulesets pushed by other components, routes incoming metric samples
//! to them, computes rule results with `since` hysteresis and emits
//! `ruleset_triggered` whenever a rule flips.

use crate::bus::{Event, EventBus};
use crate::expr::{self, EvalContext, ExprError, LeafKind, SymbolTable, Value};
use crate::metrics::{METRIC_SAMPLES_TOTAL, RULESETS_ACTIVE, RULESETS_TRIGGERED_TOTAL};
use crate::models::{
    MetricSample, ResourceHistory, Rule, RuleHistory, Ruleset, RulesetKey, ValidationError,
};
use crate::monitorer::MonitorerClient;
use crate::store::Collection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl TriggerError {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerError::Validation(_) => "ValidationError",
            TriggerError::Expr(e) => e.kind(),
        }
    }
}

/// Filter for `list`: match on owner and/or name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesetFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

type ResourceKey = (String, String);

pub struct TriggerEngine {
    rulesets: Collection<RulesetKey, Ruleset>,
    /// `(monitorer, identifier)` -> rulesets holding a matching resource.
    index: Collection<ResourceKey, BTreeSet<RulesetKey>>,
    bus: EventBus,
    monitorer: Arc<dyn MonitorerClient>,
}

impl TriggerEngine {
    pub fn new(bus: EventBus, monitorer: Arc<dyn MonitorerClient>) -> Self {
        Self {
            rulesets: Collection::new("rulesets"),
            index: Collection::new("rulesets_by_resource"),
            bus,
            monitorer,
        }
    }

    /// Event loop: consume metric samples from the mailbox.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        info!("Trigger engine started");
        while let Some(event) = rx.recv().await {
            if let Event::MetricsUpdated(sample) = event {
                METRIC_SAMPLES_TOTAL.inc();
                self.on_metric(&sample).await;
            }
        }
        warn!("Trigger engine mailbox closed");
    }

    // ####################################################
    //  RPC surface
    // ####################################################

    /// Pure computation of a ruleset against the histories it carries.
    /// Returns `None` while any resource still lacks metrics.
    pub fn compute(ruleset: &Ruleset) -> Result<Option<BTreeMap<String, bool>>, TriggerError> {
        ruleset.validate(false)?;
        Self::compute_at(ruleset, Utc::now())
    }

    /// Register a ruleset, replacing any previous one with the same
    /// `(owner, name)`, and ask the monitorers to track its resources.
    pub async fn add(&self, ruleset: Ruleset) -> Result<(), TriggerError> {
        ruleset.validate(true)?;
        let key = ruleset.key();
        debug!("added ruleset {}/{}", key.owner, key.name);

        if let Some(previous) = self.rulesets.get(&key).await {
            self.unindex(&previous).await;
        }
        for resource in &ruleset.resources {
            let resource_key = (resource.monitorer.clone(), resource.identifier.clone());
            let mut keys = self.index.get(&resource_key).await.unwrap_or_default();
            keys.insert(key.clone());
            self.index.upsert(resource_key, keys).await;
        }

        for resource in &ruleset.resources {
            if let Err(e) = self
                .monitorer
                .track(&resource.monitorer, &resource.identifier)
                .await
            {
                warn!(
                    "monitorer {} is not reachable, can't track {}: {}",
                    resource.monitorer, resource.identifier, e
                );
            }
        }

        self.rulesets.upsert(key, ruleset).await;
        RULESETS_ACTIVE.set(self.rulesets.len().await as i64);
        Ok(())
    }

    pub async fn delete(&self, owner: &str, name: &str) {
        let key = RulesetKey {
            owner: owner.to_string(),
            name: name.to_string(),
        };
        if let Some(ruleset) = self.rulesets.remove(&key).await {
            self.unindex(&ruleset).await;
        }
        RULESETS_ACTIVE.set(self.rulesets.len().await as i64);
    }

    pub async fn purge(&self, owner: &str) {
        for (key, ruleset) in self.rulesets.entries().await {
            if key.owner == owner {
                self.rulesets.remove(&key).await;
                self.unindex(&ruleset).await;
            }
        }
        RULESETS_ACTIVE.set(self.rulesets.len().await as i64);
    }

    pub async fn list(&self, filter: &RulesetFilter) -> Vec<Ruleset> {
        self.rulesets
            .list()
            .await
            .into_iter()
            .filter(|ruleset| {
                filter.owner.as_deref().is_none_or(|o| o == ruleset.owner)
                    && filter.name.as_deref().is_none_or(|n| n == ruleset.name)
            })
            .collect()
    }

    pub async fn get(&self, owner: &str, name: &str) -> Option<Ruleset> {
        self.rulesets
            .get(&RulesetKey {
                owner: owner.to_string(),
                name: name.to_string(),
            })
            .await
    }

    // ####################################################
    //  Event ingress
    // ####################################################

    /// Route a metric sample to every ruleset holding a matching resource,
    /// refresh resource histories and recompute. Idempotent: an unchanged
    /// sample updates nothing and emits nothing.
    pub async fn on_metric(&self, sample: &MetricSample) {
        let resource_key = (sample.monitorer.clone(), sample.identifier.clone());
        let keys = self.index.get(&resource_key).await.unwrap_or_default();

        for key in keys {
            let Some(mut ruleset) = self.rulesets.get(&key).await else {
                continue;
            };
            let now = Utc::now();

            let mut updated = false;
            for resource in &mut ruleset.resources {
                if resource.monitorer != sample.monitorer
                    || resource.identifier != sample.identifier
                {
                    continue;
                }
                let unchanged = resource
                    .history
                    .as_ref()
                    .is_some_and(|h| h.last_metrics == sample.metrics);
                if unchanged {
                    continue;
                }
                let history = ResourceHistory {
                    last_metrics: sample.metrics.clone(),
                    date: now,
                };
                resource.history = Some(history.clone());
                let resource_name = resource.name.clone();
                self.rulesets
                    .update(&key, |stored| {
                        if let Some(stored_resource) = stored
                            .resources
                            .iter_mut()
                            .find(|r| r.name == resource_name)
                        {
                            stored_resource.history = Some(history.clone());
                        }
                    })
                    .await;
                updated = true;
            }

            if !updated {
                continue;
            }

            match Self::compute_at(&ruleset, now) {
                Err(e) => {
                    error!(
                        "error while executing ruleset {}/{}: {}",
                        key.owner, key.name, e
                    );
                }
                Ok(None) => {
                    debug!("not enough metrics to compute the ruleset {}", key.name);
                }
                Ok(Some(results)) => {
                    self.persist_and_dispatch(&key, &ruleset, results, now).await;
                }
            }
        }
    }

    /// Write changed rule histories and emit `ruleset_triggered` when at
    /// least one rule flipped.
    async fn persist_and_dispatch(
        &self,
        key: &RulesetKey,
        ruleset: &Ruleset,
        results: BTreeMap<String, bool>,
        now: DateTime<Utc>,
    ) {
        let mut changed = false;
        for rule in &ruleset.rules {
            let Some(result) = results.get(&rule.name) else {
                continue;
            };
            let unchanged = rule
                .history
                .as_ref()
                .is_some_and(|h| h.last_result == *result);
            if unchanged {
                continue;
            }
            let history = RuleHistory {
                last_result: *result,
                date: now,
            };
            let rule_name = rule.name.clone();
            self.rulesets
                .update(key, |stored| {
                    if let Some(stored_rule) =
                        stored.rules.iter_mut().find(|r| r.name == rule_name)
                    {
                        stored_rule.history = Some(history.clone());
                    }
                })
                .await;
            changed = true;
        }

        if changed {
            debug!("triggering event 'ruleset_triggered' {:?}", results);
            RULESETS_TRIGGERED_TOTAL.inc();
            self.bus
                .publish(Event::RulesetTriggered {
                    ruleset: key.clone(),
                    rules_stats: results,
                })
                .await;
        }
    }

    async fn unindex(&self, ruleset: &Ruleset) {
        let key = ruleset.key();
        for resource in &ruleset.resources {
            let resource_key = (resource.monitorer.clone(), resource.identifier.clone());
            if let Some(mut keys) = self.index.get(&resource_key).await {
                keys.remove(&key);
                if keys.is_empty() {
                    self.index.remove(&resource_key).await;
                } else {
                    self.index.upsert(resource_key, keys).await;
                }
            }
        }
    }

    // ####################################################
    //  Evaluation
    // ####################################################

    /// Evaluate every rule of the ruleset, in declaration order, against the
    /// histories it carries. `now` anchors the `since` durations.
    pub fn compute_at(
        ruleset: &Ruleset,
        now: DateTime<Utc>,
    ) -> Result<Option<BTreeMap<String, bool>>, TriggerError> {
        // all resources must have produced metrics at least once
        let mut metrics: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for resource in &ruleset.resources {
            let Some(history) = &resource.history else {
                return Ok(None);
            };
            if history.last_metrics.is_empty() {
                return Ok(None);
            }
            metrics.insert(
                resource.name.clone(),
                history
                    .last_metrics
                    .iter()
                    .map(|(field, value)| (field.clone(), Value::from_json(value)))
                    .collect(),
            );
        }

        let table = Self::build_symbol_table(ruleset);
        let rules_by_name: BTreeMap<&str, &Rule> = ruleset
            .rules
            .iter()
            .map(|rule| (rule.name.as_str(), rule))
            .collect();

        let mut computed: BTreeMap<String, bool> = BTreeMap::new();
        for rule in &ruleset.rules {
            let compiled = expr::compile(&rule.expression, &table)?;
            let ctx = RulesetEvalContext {
                metrics: &metrics,
                rules: &rules_by_name,
                computed: &computed,
                now,
            };
            let result = expr::eval(&compiled, &ctx)?;
            computed.insert(rule.name.clone(), result);
        }
        Ok(Some(computed))
    }

    fn build_symbol_table(ruleset: &Ruleset) -> SymbolTable {
        let mut table = SymbolTable::new();
        for resource in &ruleset.resources {
            table.add_object(&resource.name, LeafKind::Bool);
            let subtable = table.subtable_mut(&resource.name);
            if let Some(history) = &resource.history {
                for (field, value) in &history.last_metrics {
                    subtable.add_object(field, LeafKind::of_json(value));
                }
            }
        }
        let rules = table.subtable_mut("rules");
        for rule in &ruleset.rules {
            rules.add_object(&rule.name, LeafKind::Bool);
            rules.subtable_mut(&rule.name).add_object("since", LeafKind::Duration);
        }
        table
    }
}

/// Resolution context for one rule evaluation pass.
///
/// `rules:<name>` resolves to the value computed earlier in the same pass,
/// falling back to the rule's history (default false). `rules:<name>:since`
/// is the duration since the rule last changed, and collapses to zero as
/// soon as the current value disagrees with the history.
struct RulesetEvalContext<'a> {
    metrics: &'a BTreeMap<String, BTreeMap<String, Value>>,
    rules: &'a BTreeMap<&'a str, &'a Rule>,
    computed: &'a BTreeMap<String, bool>,
    now: DateTime<Utc>,
}

impl RulesetEvalContext<'_> {
    fn rule_result(&self, name: &str) -> Value {
        if let Some(current) = self.computed.get(name) {
            return Value::Bool(*current);
        }
        let last = self
            .rules
            .get(name)
            .and_then(|rule| rule.history.as_ref())
            .map(|history| history.last_result)
            .unwrap_or(false);
        Value::Bool(last)
    }

    fn rule_since(&self, name: &str) -> Value {
        let Some(history) = self.rules.get(name).and_then(|rule| rule.history.as_ref()) else {
            return Value::Duration(0.0);
        };
        if let Some(current) = self.computed.get(name)
            && *current != history.last_result
        {
            return Value::Duration(0.0);
        }
        let elapsed = (self.now - history.date).num_milliseconds() as f64 / 1000.0;
        Value::Duration(elapsed.max(0.0))
    }
}

impl EvalContext for RulesetEvalContext<'_> {
    fn resolve(&self, path: &[String]) -> Result<Value, ExprError> {
        match path {
            [name] => {
                if name == "rules" {
                    return Ok(Value::Bool(!self.rules.is_empty()));
                }
                match self.metrics.get(name) {
                    Some(fields) => Ok(Value::Bool(!fields.is_empty())),
                    None => Err(ExprError::Missing {
                        path: name.clone(),
                    }),
                }
            }
            [first, second] if first == "rules" => Ok(self.rule_result(second)),
            [first, second, third] if first == "rules" && third == "since" => {
                Ok(self.rule_since(second))
            }
            [resource, field] => self
                .metrics
                .get(resource)
                .and_then(|fields| fields.get(field))
                .cloned()
                .ok_or_else(|| ExprError::Missing {
                    path: path.join(":"),
                }),
            _ => Err(ExprError::Missing {
                path: path.join(":"),
            }),
        }
    }
}
