//! Dependency solver.
//!
//! Given a catalog of services, their versions and each version's
//! provide/require contract, enumerate every globally compatible
//! `service -> version` assignment by depth-first backtracking, newest
//! versions first. Also explains a fixed assignment by counting its violated
//! require clauses.

use crate::expr::{self, Compiled, ExprError, LeafKind, MapContext, SymbolTable, Value};
use crate::metrics::{SOLVER_DURATION, SOLVER_RUNS_TOTAL};
use crate::models::version_rank;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl SolverError {
    pub fn kind(&self) -> &'static str {
        match self {
            SolverError::Validation(_) => "ValidationError",
            SolverError::Expr(e) => e.kind(),
        }
    }
}

/// One service of the solver catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverService {
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionSpec {
    #[serde(default)]
    pub provide: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub require: Vec<String>,
}

/// A `(service, version)` pair whose requires failed to compile. Recorded
/// and excluded from the search, never surfaced as a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub expression: Option<String>,
    pub service: String,
    pub version: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverErrorInfo {
    pub kind: String,
    pub message: String,
}

/// A complete `service -> version` mapping.
pub type Assignment = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub results: Vec<Assignment>,
    pub errors: Vec<SolverErrorInfo>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequire {
    pub expression: String,
    pub service: String,
    pub provided: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplainOutcome {
    pub failed_count: usize,
    pub failed: Vec<FailedRequire>,
    pub anomalies: Vec<Anomaly>,
}

/// Enumerate compatible assignments. Enumeration stops once `limit`
/// solutions have been produced, so a caller interested in the first N pays
/// only for those.
pub fn solve_dependencies(
    catalog: &[SolverService],
    extra_constraints: &[String],
    limit: Option<usize>,
) -> SolveOutcome {
    SOLVER_RUNS_TOTAL.inc();
    let _timer = SOLVER_DURATION.start_timer();

    let table = build_symbol_table(catalog);
    let mut anomalies = Vec::new();
    let variables = compile_conditions(catalog, &table, &mut anomalies);

    let extra = match compile_extra(extra_constraints, &table) {
        Ok(extra) => extra,
        Err(e) => {
            return SolveOutcome {
                results: Vec::new(),
                errors: vec![SolverErrorInfo {
                    kind: "missing scope".to_string(),
                    message: e.to_string(),
                }],
                anomalies,
            };
        }
    };

    let mut search = Search {
        extra: &extra,
        partial: Vec::new(),
        seen: BTreeSet::new(),
        results: Vec::new(),
        anomalies: &mut anomalies,
        limit,
    };
    let _ = search.backtrack(&variables);
    let results = search.results;

    debug!(
        "solver enumerated {} assignment(s) over {} service(s)",
        results.len(),
        catalog.len()
    );
    SolveOutcome {
        results,
        errors: Vec::new(),
        anomalies,
    }
}

/// Explain a fixed assignment: the catalog must carry exactly one version
/// per service. Returns the number of violated clauses with the offending
/// expressions.
pub fn explain(
    catalog: &[SolverService],
    extra_constraints: &[String],
) -> Result<ExplainOutcome, SolverError> {
    let table = build_symbol_table(catalog);
    let mut anomalies = Vec::new();
    let variables = compile_conditions(catalog, &table, &mut anomalies);
    let extra = compile_extra(extra_constraints, &table)?;

    for service in catalog {
        if service.versions.len() != 1 {
            return Err(SolverError::Validation(format!(
                "you must provide only one version for service {} to explain this phase, got {}",
                service.name,
                service.versions.len()
            )));
        }
    }

    // anomalous pairs are excluded: their provides and requires do not
    // participate
    let selections: Vec<(&Variable, &CandidateVersion)> = variables
        .iter()
        .filter_map(|variable| variable.versions.first().map(|v| (variable, v)))
        .collect();
    let provided = build_provided(
        selections
            .iter()
            .map(|(variable, version)| (variable.name.as_str(), *version)),
    );
    let value_map = to_value_map(&provided);
    let ctx = MapContext::new(&value_map);

    let mut failed = Vec::new();
    for (variable, version) in &selections {
        for require in &version.requires {
            if !matches!(expr::eval(require, &ctx), Ok(true)) {
                failed.push(FailedRequire {
                    expression: require.source.clone(),
                    service: variable.name.clone(),
                    provided: provided.clone(),
                });
            }
        }
    }
    for constraint in &extra {
        if !matches!(expr::eval(constraint, &ctx), Ok(true)) {
            failed.push(FailedRequire {
                expression: constraint.source.clone(),
                service: "<extra_constraint>".to_string(),
                provided: provided.clone(),
            });
        }
    }

    Ok(ExplainOutcome {
        failed_count: failed.len(),
        failed,
        anomalies,
    })
}

// ####################################################
//  Compilation
// ####################################################

/// Build the root symbol table from the union of all provides over all
/// versions of all services. Every path prefix without an explicit provider
/// becomes a presence boolean, as does each service name.
fn build_symbol_table(catalog: &[SolverService]) -> SymbolTable {
    let mut table = SymbolTable::new();
    for service in catalog {
        table.add_object(&service.name, LeafKind::Bool);
        for version in service.versions.values() {
            for (provide, value) in &version.provide {
                let segments: Vec<&str> = provide.split(':').collect();
                let Some((leaf, prefix)) = segments.split_last() else {
                    continue;
                };
                table
                    .ensure_path(prefix)
                    .add_object(leaf, LeafKind::of_json(value));
            }
        }
    }
    table.complete_with_presence();
    table
}

struct CandidateVersion {
    id: String,
    provide: BTreeMap<String, serde_json::Value>,
    requires: Vec<Compiled>,
}

struct Variable {
    name: String,
    /// newest first
    versions: Vec<CandidateVersion>,
}

fn compile_conditions(
    catalog: &[SolverService],
    table: &SymbolTable,
    anomalies: &mut Vec<Anomaly>,
) -> Vec<Variable> {
    let mut variables = Vec::new();
    for service in catalog {
        let mut version_ids: Vec<&String> = service.versions.keys().collect();
        version_ids.sort_by(|a, b| version_rank(b).cmp(&version_rank(a)));

        let mut versions = Vec::new();
        'versions: for id in version_ids {
            let spec = &service.versions[id];
            let mut requires = Vec::new();
            for require in &spec.require {
                match expr::compile(require, table) {
                    Ok(compiled) => requires.push(compiled),
                    Err(e) => {
                        anomalies.push(Anomaly {
                            expression: Some(require.clone()),
                            service: service.name.clone(),
                            version: Some(id.clone()),
                            error: e.to_string(),
                        });
                        continue 'versions;
                    }
                }
            }
            versions.push(CandidateVersion {
                id: id.clone(),
                provide: spec.provide.clone(),
                requires,
            });
        }
        variables.push(Variable {
            name: service.name.clone(),
            versions,
        });
    }
    variables
}

fn compile_extra(
    extra_constraints: &[String],
    table: &SymbolTable,
) -> Result<Vec<Compiled>, ExprError> {
    extra_constraints
        .iter()
        .map(|constraint| expr::compile(constraint, table))
        .collect()
}

// ####################################################
//  Search
// ####################################################

fn build_provided<'a>(
    selections: impl Iterator<Item = (&'a str, &'a CandidateVersion)>,
) -> BTreeMap<String, serde_json::Value> {
    let mut provided = BTreeMap::new();
    for (service, version) in selections {
        for (key, value) in &version.provide {
            provided.insert(key.clone(), value.clone());
        }
        provided
            .entry(service.to_string())
            .or_insert_with(|| serde_json::Value::String(version.id.clone()));
    }
    provided
}

fn to_value_map(provided: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, Value> {
    provided
        .iter()
        .map(|(key, value)| (key.clone(), Value::from_json(value)))
        .collect()
}

struct Search<'a> {
    extra: &'a [Compiled],
    partial: Vec<(&'a str, &'a CandidateVersion)>,
    seen: BTreeSet<String>,
    results: Vec<Assignment>,
    anomalies: &'a mut Vec<Anomaly>,
    limit: Option<usize>,
}

impl<'a> Search<'a> {
    fn backtrack(&mut self, variables: &'a [Variable]) -> ControlFlow<()> {
        let remaining: Vec<&'a Variable> = variables.iter().collect();
        self.backtrack_remaining(&remaining)
    }

    /// Permutation-exploring DFS: at each level any remaining service may be
    /// picked next, so an assignment reachable only by selecting providers
    /// before their dependents is still found. Identical assignments reached
    /// through different orders are deduplicated.
    fn backtrack_remaining(&mut self, remaining: &[&'a Variable]) -> ControlFlow<()> {
        if remaining.is_empty() {
            let assignment: Assignment = self
                .partial
                .iter()
                .map(|(service, version)| (service.to_string(), version.id.clone()))
                .collect();
            let fingerprint = serde_json::to_string(&assignment).expect("assignment serializes");
            if self.seen.insert(fingerprint) {
                self.results.push(assignment);
                if let Some(limit) = self.limit
                    && self.results.len() >= limit
                {
                    return ControlFlow::Break(());
                }
            }
            return ControlFlow::Continue(());
        }

        for (i, variable) in remaining.iter().enumerate() {
            for version in &variable.versions {
                self.partial.push((variable.name.as_str(), version));
                if self.check_candidate(version) {
                    let mut rest: Vec<&'a Variable> = Vec::with_capacity(remaining.len() - 1);
                    rest.extend(remaining[..i].iter().copied());
                    rest.extend(remaining[i + 1..].iter().copied());
                    if self.backtrack_remaining(&rest).is_break() {
                        self.partial.pop();
                        return ControlFlow::Break(());
                    }
                }
                self.partial.pop();
            }
        }
        ControlFlow::Continue(())
    }

    /// Test the newest selection's requires plus every extra constraint
    /// against what the partial assignment provides.
    fn check_candidate(&mut self, candidate: &CandidateVersion) -> bool {
        let provided = build_provided(self.partial.iter().map(|(s, v)| (*s, *v)));
        let value_map = to_value_map(&provided);
        let ctx = MapContext::new(&value_map);

        for require in candidate.requires.iter().chain(self.extra.iter()) {
            match expr::eval(require, &ctx) {
                Ok(true) => {}
                Ok(false) | Err(ExprError::Missing { .. }) => return false,
                Err(e) => {
                    // type mismatch at evaluation: record and reject
                    let (service, version) = self
                        .partial
                        .last()
                        .map(|(s, v)| (s.to_string(), v.id.clone()))
                        .unwrap_or_default();
                    self.anomalies.push(Anomaly {
                        expression: Some(require.source.clone()),
                        service,
                        version: Some(version),
                        error: e.to_string(),
                    });
                    return false;
                }
            }
        }
        true
    }
}
