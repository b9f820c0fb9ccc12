//! Upgrade planner.
//!
//! Maintains the catalog of every observed service version, picks the best
//! globally compatible assignment for the fleet, builds a one-service-at-a-
//! time step sequence that never crosses an incompatible state, and drives
//! its execution through the orchestrator.

use crate::bus::{Event, EventBus};
use crate::metrics::{SCHEDULES_ABORTED_TOTAL, UPGRADE_STEPS_TOTAL, UPGRADES_STARTED_TOTAL};
use crate::models::{
    CatalogEntry, ImageVersion, Phase, PhaseRecord, Schedule, ScheduleState, Service, ServiceDiff,
    Step, StepState, VersionInfo, version_rank,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, UpgradeImage};
use crate::solver::{
    self, Assignment, ExplainOutcome, SolverError, SolverErrorInfo, SolverService, VersionSpec,
};
use crate::store::Collection;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("{0}")]
    Validation(String),

    #[error("Upgrade diverged from the running schedule: {0}")]
    Divergence(String),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl PlannerError {
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerError::Validation(_) => "ValidationError",
            PlannerError::Divergence(_) => "Divergence",
            PlannerError::Solver(e) => e.kind(),
            PlannerError::Orchestrator(e) => e.kind(),
        }
    }
}

/// Which versions of the catalog participate in goal selection.
#[derive(Debug, Clone)]
pub enum CatalogFilter {
    /// Keep versions at least as new as the current one; `latest` always
    /// passes when available. The default.
    NoDowngrade,
    /// Keep every available version.
    AcceptAll,
    /// Keep only the explicitly pinned versions.
    Static(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedPlan {
    pub best_phase: Option<Phase>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveErrors {
    pub step: String,
    pub error: Vec<SolverErrorInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resolved {
    pub result: Option<ResolvedPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ResolveErrors>,
}

pub struct UpgradePlanner {
    catalog: Collection<String, CatalogEntry>,
    /// all schedules ever started; at most one is running
    schedules: Mutex<Vec<Schedule>>,
    /// append-only version history
    phases: RwLock<Vec<PhaseRecord>>,
    orchestrator: Arc<Orchestrator>,
    bus: EventBus,
    solver_limit: usize,
}

impl UpgradePlanner {
    pub fn new(orchestrator: Arc<Orchestrator>, bus: EventBus, solver_limit: usize) -> Self {
        Self {
            catalog: Collection::new("catalog"),
            schedules: Mutex::new(Vec::new()),
            phases: RwLock::new(Vec::new()),
            orchestrator,
            bus,
            solver_limit,
        }
    }

    /// Event loop.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        info!("Upgrade planner started");
        while let Some(event) = rx.recv().await {
            match event {
                Event::ServiceUpdated { service, diff } => {
                    self.on_service_updated(&service, &diff).await;
                }
                Event::NewImage {
                    service,
                    image,
                    scale_config,
                } => {
                    let dependencies = scale_config
                        .map(|config| config.dependencies)
                        .unwrap_or_default();
                    self.on_new_image(&service, &image, dependencies).await;
                }
                Event::CleanedImage { service, image } => {
                    self.on_cleaned_image(&service, &image).await;
                }
                Event::NewVersion { service, .. } => {
                    debug!("new version for {}", service);
                    if let Err(e) = self.run_available_upgrade().await {
                        error!("can't run available upgrade: {}", e);
                    }
                }
                _ => {}
            }
        }
        warn!("Upgrade planner mailbox closed");
    }

    /// Startup check: a catalog entry pinned to a version missing from its
    /// own version list is healed from the orchestrator's live state.
    pub async fn sanity_check(&self) {
        for (name, entry) in self.catalog.entries().await {
            if entry.versions.contains_key(&entry.version) {
                continue;
            }
            error!(
                "service {} is fixed to version {} which is not listed in its available versions",
                name, entry.version
            );
            let Some(service) = self.orchestrator.get(&name).await else {
                continue;
            };
            let Some(version) = service.image.info.version.clone() else {
                continue;
            };
            let dependencies = service
                .scale_config
                .as_ref()
                .map(|config| config.dependencies.clone())
                .unwrap_or_default();
            let info = VersionInfo {
                version: version.clone(),
                image_info: service.image.info.clone(),
                dependencies,
                available: true,
            };
            self.catalog
                .update(&name, |entry| {
                    entry.version = version.clone();
                    entry.versions.insert(version.clone(), info.clone());
                    entry.service = service.clone();
                })
                .await;
        }
    }

    // ####################################################
    //  Catalog maintenance
    // ####################################################

    /// A service finished updating: move its current version, snapshot the
    /// fleet into the version history, and continue any running plan.
    pub async fn on_service_updated(&self, service: &Service, diff: &ServiceDiff) {
        if !diff.is_completed_update(&service.mode) {
            return;
        }
        let Some(version) = service.image.info.version.clone() else {
            warn!("service {} has no version on its tag, ignored", service.name);
            return;
        };

        let from = match self.catalog.get(&service.name).await {
            Some(entry) => {
                if entry.version == version {
                    // false positive: the reported version is already current
                    return;
                }
                let from = entry.version.clone();
                self.catalog
                    .update(&service.name, |entry| {
                        entry.service = service.clone();
                        entry.version = version.clone();
                    })
                    .await;
                Some(from)
            }
            None => {
                let dependencies = service
                    .scale_config
                    .as_ref()
                    .map(|config| config.dependencies.clone())
                    .unwrap_or_default();
                let entry = CatalogEntry {
                    name: service.name.clone(),
                    version: version.clone(),
                    service: service.clone(),
                    versions: BTreeMap::from([(
                        version.clone(),
                        VersionInfo {
                            version: version.clone(),
                            image_info: service.image.info.clone(),
                            dependencies,
                            available: true,
                        },
                    )]),
                };
                self.catalog.upsert(service.name.clone(), entry).await;
                None
            }
        };

        let snapshot = self.current_phase().await;
        self.phases.write().await.push(PhaseRecord {
            updated_service: service.name.clone(),
            from: from.clone(),
            to: version.clone(),
            snapshot,
            date: Utc::now(),
        });

        self.continue_scheduled_plan(&service.name, from.as_deref(), &version)
            .await;
    }

    /// A new image version is available: record it, or no-op when the same
    /// version with the same dependencies is already known.
    pub async fn on_new_image(
        &self,
        service: &Service,
        image: &ImageVersion,
        dependencies: crate::models::Dependencies,
    ) {
        let Some(version_number) = image.version.clone() else {
            warn!("new image for {} has no version on its tag, ignored", service.name);
            return;
        };

        if let Some(entry) = self.catalog.get(&service.name).await
            && let Some(existing) = entry.versions.get(&version_number)
            && existing.dependencies == dependencies
        {
            return; // same image with the same contract, nothing new
        }

        let new_version = VersionInfo {
            version: version_number.clone(),
            image_info: image.clone(),
            dependencies,
            available: true,
        };

        if self.catalog.contains(&service.name).await {
            let inserted = new_version.clone();
            self.catalog
                .update(&service.name, |entry| {
                    entry.versions.insert(version_number.clone(), inserted.clone());
                })
                .await;
        } else {
            let current = service
                .image
                .info
                .version
                .clone()
                .unwrap_or_else(|| version_number.clone());
            let entry = CatalogEntry {
                name: service.name.clone(),
                version: current,
                service: service.clone(),
                versions: BTreeMap::from([(version_number.clone(), new_version.clone())]),
            };
            self.catalog.upsert(service.name.clone(), entry).await;
        }
        debug!("upserted catalog version {} for {}", version_number, service.name);

        self.bus
            .publish(Event::NewVersion {
                service: service.name.clone(),
                new: new_version,
            })
            .await;
    }

    /// A tag disappeared from the registry: the version stays in the catalog
    /// (the running instance may still reference it) but stops being a
    /// candidate.
    pub async fn on_cleaned_image(&self, service_name: &str, image: &ImageVersion) {
        let Some(version) = &image.version else {
            return;
        };
        self.catalog
            .update(&service_name.to_string(), |entry| {
                if let Some(info) = entry.versions.get_mut(version) {
                    info.available = false;
                }
            })
            .await;
    }

    // ####################################################
    //  RPC surface
    // ####################################################

    pub async fn list_catalog(&self) -> Vec<CatalogEntry> {
        self.catalog.list().await
    }

    pub async fn version_history(&self) -> Vec<PhaseRecord> {
        self.phases.read().await.clone()
    }

    pub async fn schedules(&self) -> Vec<Schedule> {
        self.schedules.lock().await.clone()
    }

    pub async fn running_schedule(&self) -> Option<Schedule> {
        self.schedules
            .lock()
            .await
            .iter()
            .find(|schedule| schedule.state == ScheduleState::Running)
            .cloned()
    }

    /// Explain a pinned `service -> version` phase: zero failures means the
    /// phase is compatible.
    pub async fn explain_phase(
        &self,
        phase: &BTreeMap<String, String>,
    ) -> Result<ExplainOutcome, PlannerError> {
        let catalog = self
            .build_catalog(&CatalogFilter::Static(phase.clone()))
            .await;
        Ok(solver::explain(&catalog, &[])?)
    }

    /// Resolve the best phase for the current catalog and build the steps to
    /// reach it.
    pub async fn resolve_upgrade_and_steps(&self) -> Resolved {
        let catalog = self.build_catalog(&CatalogFilter::NoDowngrade).await;
        let reduced = reduce_catalog(&catalog);
        let outcome = solver::solve_dependencies(&reduced, &[], Some(self.solver_limit));
        if !outcome.errors.is_empty() {
            return Resolved {
                result: None,
                errors: Some(ResolveErrors {
                    step: "dependency_solve".to_string(),
                    error: outcome.errors,
                }),
            };
        }

        let Some((goal, score)) = self.solve_best_phase(&outcome.results).await else {
            return Resolved {
                result: Some(ResolvedPlan::default()),
                errors: None,
            };
        };
        debug!("best phase {:?} scored {}", goal, score);

        let steps = self.build_steps(&goal).await;
        match &steps {
            Some(steps) if !steps.is_empty() => {
                debug!(
                    "resolved steps:\n{}",
                    steps
                        .iter()
                        .map(|step| format!(
                            "{} {}=>{}",
                            step.service,
                            step.from.as_deref().unwrap_or("?"),
                            step.to
                        ))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
            }
            Some(_) => debug!("already in the goal phase"),
            None => debug!("no step ordering reaches the phase {:?}", goal),
        }

        Resolved {
            result: Some(ResolvedPlan {
                best_phase: Some(Phase::from_map(&goal)),
                steps: steps.unwrap_or_default(),
            }),
            errors: None,
        }
    }

    /// Start executing the best available upgrade. Any previously running
    /// schedule is aborted first.
    pub async fn run_available_upgrade(&self) -> Result<Option<Schedule>, PlannerError> {
        let resolved = self.resolve_upgrade_and_steps().await;
        let Some(plan) = resolved.result else {
            return Ok(None);
        };
        if plan.steps.is_empty() {
            return Ok(None);
        }

        let mut schedules = self.schedules.lock().await;
        for schedule in schedules.iter_mut() {
            if schedule.state == ScheduleState::Running {
                SCHEDULES_ABORTED_TOTAL.inc();
                schedule.abort();
            }
        }

        let mut schedule = Schedule::new(
            plan.steps
                .iter()
                .map(|step| Step {
                    service: step.service.clone(),
                    from: step.from.clone(),
                    to: step.to.clone(),
                    state: StepState::Waiting,
                })
                .collect(),
        );
        UPGRADES_STARTED_TOTAL.inc();
        self.run_step(&mut schedule, 0).await;
        schedules.push(schedule.clone());
        Ok(Some(schedule))
    }

    /// A service finished an upgrade: advance the running schedule, finish
    /// it on the last step, or abort it when the observed upgrade does not
    /// belong to it.
    pub async fn continue_scheduled_plan(
        &self,
        service_name: &str,
        from: Option<&str>,
        to: &str,
    ) {
        let mut schedules = self.schedules.lock().await;
        let Some(running) = schedules
            .iter_mut()
            .find(|schedule| schedule.state == ScheduleState::Running)
        else {
            info!(
                "upgrade of service outside of an upgrade plan for {} {:?}=>{}",
                service_name, from, to
            );
            return;
        };

        let mut updated_idx = None;
        let mut next_idx = None;
        for (i, step) in running.steps.iter().enumerate() {
            if step.service == service_name {
                updated_idx = Some(i);
            } else if step.state == StepState::Done {
                continue;
            } else if step.state == StepState::Waiting {
                next_idx = Some(i);
                break;
            }
        }

        match (updated_idx, next_idx) {
            (None, _) => {
                // out of sync with the upgrade process: the plan is over
                warn!(
                    "service {} is not part of the running schedule, aborting it",
                    service_name
                );
                SCHEDULES_ABORTED_TOTAL.inc();
                running.abort();
            }
            (Some(updated), None) => {
                running.steps[updated].state = StepState::Done;
                running.state = ScheduleState::Done;
                info!("upgrade schedule finished with {}", service_name);
            }
            (Some(updated), Some(next)) => {
                running.steps[updated].state = StepState::Done;
                let mut schedule = running.clone();
                self.run_step(&mut schedule, next).await;
                *running = schedule;
            }
        }
    }

    // ####################################################
    //  Private
    // ####################################################

    /// Mark the step running and ask the orchestrator to perform it. A step
    /// that cannot be issued aborts the whole schedule.
    async fn run_step(&self, schedule: &mut Schedule, index: usize) {
        let step = &schedule.steps[index];
        let Some(entry) = self.catalog.get(&step.service).await else {
            error!(
                "we should upgrade {} {:?}=>{} but we can't find this service",
                step.service, step.from, step.to
            );
            SCHEDULES_ABORTED_TOTAL.inc();
            schedule.abort();
            return;
        };
        let Some(info) = entry.versions.get(&step.to) else {
            error!(
                "we should upgrade {} {:?}=>{} but we can't find this version in the catalog",
                step.service, step.from, step.to
            );
            SCHEDULES_ABORTED_TOTAL.inc();
            schedule.abort();
            return;
        };

        schedule.steps[index].state = StepState::Running;
        UPGRADE_STEPS_TOTAL.inc();
        debug!(
            "asking the orchestrator to switch {} to image {}",
            entry.name,
            info.image_info.unique_image_id()
        );
        if let Err(e) = self
            .orchestrator
            .upgrade_service(&entry.name, &UpgradeImage::Info(info.image_info.clone()))
            .await
        {
            error!("can't issue upgrade step for {}: {}", entry.name, e);
            SCHEDULES_ABORTED_TOTAL.inc();
            schedule.abort();
        }
    }

    async fn current_phase(&self) -> BTreeMap<String, String> {
        self.catalog
            .list()
            .await
            .into_iter()
            .map(|entry| (entry.name, entry.version))
            .collect()
    }

    /// Project the catalog into the solver's input shape, applying the
    /// version filter.
    pub async fn build_catalog(&self, filter: &CatalogFilter) -> Vec<SolverService> {
        let mut result = Vec::new();
        for entry in self.catalog.list().await {
            let mut versions = BTreeMap::new();
            for info in entry.versions.values() {
                let keep = match filter {
                    CatalogFilter::NoDowngrade => {
                        info.available
                            && (info.version == "latest"
                                || version_rank(&info.version) >= version_rank(&entry.version))
                    }
                    CatalogFilter::AcceptAll => info.available,
                    CatalogFilter::Static(phase) => {
                        phase.get(&entry.name) == Some(&info.version)
                    }
                };
                if keep {
                    versions.insert(
                        info.version.clone(),
                        VersionSpec {
                            provide: info.dependencies.provide.clone(),
                            require: info.dependencies.require.clone(),
                        },
                    );
                }
            }
            result.push(SolverService {
                name: entry.name.clone(),
                versions,
            });
        }
        result
    }

    /// Rank each phase by summing, per pin, the index of the version in the
    /// service's newest-first version list: zero means every service at its
    /// newest. Minimum wins; ties go to the first seen.
    async fn solve_best_phase(&self, phases: &[Assignment]) -> Option<(Assignment, usize)> {
        let mut newest_first: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.catalog.list().await {
            let mut ids: Vec<String> = entry.versions.keys().cloned().collect();
            ids.sort_by(|a, b| version_rank(b).cmp(&version_rank(a)));
            newest_first.insert(entry.name.clone(), ids);
        }

        let mut best: Option<(Assignment, usize)> = None;
        for phase in phases {
            let mut score = 0;
            for (service, version) in phase {
                let Some(ids) = newest_first.get(service) else {
                    continue;
                };
                match ids.iter().position(|id| id == version) {
                    Some(index) => score += index,
                    None => {
                        error!("{} not in the known versions of {}", version, service);
                    }
                }
            }
            if best.as_ref().is_none_or(|(_, best_score)| score < *best_score) {
                best = Some((phase.clone(), score));
            }
        }
        best
    }

    /// Order the changed services so every prefix of the plan leaves the
    /// fleet compatible. Backtracking over permutations, gated by
    /// `explain_phase == 0` at each extension.
    pub async fn build_steps(&self, goal: &Assignment) -> Option<Vec<Step>> {
        let current = self.current_phase().await;
        if current == *goal {
            debug!("we already are in the goal phase");
            return Some(Vec::new());
        }

        let mut changed = Vec::new();
        for (service, version) in goal {
            match current.get(service) {
                Some(from) if from != version => {
                    changed.push((service.clone(), from.clone(), version.clone()));
                }
                _ => {}
            }
        }

        let mut steps = Vec::new();
        if self
            .backtrack_steps(&mut steps, current, &changed)
            .await
        {
            Some(steps)
        } else {
            None
        }
    }

    /// Box needed: async recursion.
    fn backtrack_steps<'a>(
        &'a self,
        steps: &'a mut Vec<Step>,
        fixed: BTreeMap<String, String>,
        rest: &'a [(String, String, String)],
    ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            if rest.is_empty() {
                return true;
            }
            for (service, from, to) in rest {
                let mut tested = fixed.clone();
                tested.insert(service.clone(), to.clone());
                debug!("try if it's possible: {:?}", tested);

                let compatible = match self.explain_phase(&tested).await {
                    Ok(outcome) => outcome.failed_count == 0,
                    Err(e) => {
                        debug!("can't explain phase {:?}: {}", tested, e);
                        false
                    }
                };
                if !compatible {
                    continue;
                }

                steps.push(Step {
                    service: service.clone(),
                    from: Some(from.clone()),
                    to: to.clone(),
                    state: StepState::Waiting,
                });
                let remaining: Vec<(String, String, String)> = rest
                    .iter()
                    .filter(|(name, _, _)| name != service)
                    .cloned()
                    .collect();
                if self.backtrack_steps(steps, tested, &remaining).await {
                    return true;
                }
                steps.pop();
            }
            false
        })
    }
}

/// Group versions with identical provide/require contracts and keep only the
/// newest representative of each group. This collapses long runs of patch
/// versions and keeps the solver search tractable on real fleets.
pub fn reduce_catalog(catalog: &[SolverService]) -> Vec<SolverService> {
    catalog
        .iter()
        .map(|service| {
            let mut representatives: BTreeMap<String, (String, VersionSpec)> = BTreeMap::new();
            for (version, spec) in &service.versions {
                let fingerprint =
                    serde_json::to_string(spec).expect("version spec serializes");
                match representatives.get(&fingerprint) {
                    Some((kept, _)) if version_rank(kept) >= version_rank(version) => {}
                    _ => {
                        representatives
                            .insert(fingerprint, (version.clone(), spec.clone()));
                    }
                }
            }
            SolverService {
                name: service.name.clone(),
                versions: representatives.into_values().collect(),
            }
        })
        .collect()
}
