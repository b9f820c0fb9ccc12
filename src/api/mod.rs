//! RPC command surface.
//!
//! Every core operation is one JSON-over-HTTP method answering the same
//! envelope: `{"status": "success", "result": ...}` or `{"status": "error",
//! "kind": ..., "message": ..., "extra": ...}`.

use crate::load::LoadController;
use crate::models::{Ruleset, Service};
use crate::orchestrator::{Orchestrator, UpgradeImage};
use crate::planner::UpgradePlanner;
use crate::solver::{self, SolverService};
use crate::trigger::{RulesetFilter, TriggerEngine};
use anyhow::Result;
use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<TriggerEngine>,
    pub load: Arc<LoadController>,
    pub planner: Arc<UpgradePlanner>,
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn start_rpc_server(addr: &str, state: AppState) -> Result<JoinHandle<()>> {
    let app = router(state);

    info!("Starting RPC server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("RPC server failed");
    });

    Ok(handle)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc/trigger/compute", post(trigger_compute))
        .route("/rpc/trigger/add", post(trigger_add))
        .route("/rpc/trigger/delete", post(trigger_delete))
        .route("/rpc/trigger/purge", post(trigger_purge))
        .route("/rpc/trigger/list", post(trigger_list))
        .route("/rpc/solver/solve_dependencies", post(solver_solve))
        .route("/rpc/solver/explain", post(solver_explain))
        .route("/rpc/load/monitor_service", post(load_monitor))
        .route("/rpc/load/unmonitor_service", post(load_unmonitor))
        .route("/rpc/load/list", post(load_list))
        .route("/rpc/planner/list_catalog", post(planner_list_catalog))
        .route("/rpc/planner/explain_phase", post(planner_explain_phase))
        .route(
            "/rpc/planner/resolve_upgrade_and_steps",
            post(planner_resolve),
        )
        .route(
            "/rpc/planner/run_available_upgrade",
            post(planner_run_upgrade),
        )
        .route("/rpc/planner/history", post(planner_history))
        .route("/rpc/planner/schedules", post(planner_schedules))
        .route("/rpc/orchestrator/monitor", post(orchestrator_monitor))
        .route("/rpc/orchestrator/unmonitor", post(orchestrator_unmonitor))
        .route("/rpc/orchestrator/get", post(orchestrator_get))
        .route("/rpc/orchestrator/list_service", post(orchestrator_list))
        .route("/rpc/orchestrator/scale", post(orchestrator_scale))
        .route(
            "/rpc/orchestrator/upgrade_service",
            post(orchestrator_upgrade),
        )
        .route(
            "/rpc/orchestrator/get_best_scale",
            post(orchestrator_best_scale),
        )
        .route("/rpc/orchestrator/reload", post(orchestrator_reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn success<T: serde::Serialize>(result: T) -> Json<Value> {
    Json(json!({
        "status": "success",
        "result": serde_json::to_value(result).unwrap_or(Value::Null),
    }))
}

fn failure(kind: &str, message: impl ToString) -> Json<Value> {
    Json(json!({
        "status": "error",
        "kind": kind,
        "message": message.to_string(),
        "extra": {},
    }))
}

// ####################################################
//  Trigger
// ####################################################

#[derive(Deserialize)]
struct RulesetPayload {
    ruleset: Ruleset,
}

async fn trigger_compute(Json(payload): Json<RulesetPayload>) -> Json<Value> {
    match TriggerEngine::compute(&payload.ruleset) {
        Ok(result) => success(result),
        Err(e) => failure(e.kind(), e),
    }
}

async fn trigger_add(
    State(state): State<AppState>,
    Json(payload): Json<RulesetPayload>,
) -> Json<Value> {
    match state.trigger.add(payload.ruleset).await {
        Ok(()) => success(Value::Null),
        Err(e) => failure(e.kind(), e),
    }
}

#[derive(Deserialize)]
struct RulesetKeyPayload {
    owner: String,
    name: String,
}

async fn trigger_delete(
    State(state): State<AppState>,
    Json(payload): Json<RulesetKeyPayload>,
) -> Json<Value> {
    state.trigger.delete(&payload.owner, &payload.name).await;
    success(Value::Null)
}

#[derive(Deserialize)]
struct OwnerPayload {
    owner: String,
}

async fn trigger_purge(
    State(state): State<AppState>,
    Json(payload): Json<OwnerPayload>,
) -> Json<Value> {
    state.trigger.purge(&payload.owner).await;
    success(Value::Null)
}

#[derive(Deserialize, Default)]
struct ListPayload {
    #[serde(default)]
    filter: RulesetFilter,
}

async fn trigger_list(
    State(state): State<AppState>,
    Json(payload): Json<ListPayload>,
) -> Json<Value> {
    success(state.trigger.list(&payload.filter).await)
}

// ####################################################
//  Solver
// ####################################################

#[derive(Deserialize)]
struct SolvePayload {
    catalog: Vec<SolverService>,
    #[serde(default)]
    extra_constraints: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn solver_solve(Json(payload): Json<SolvePayload>) -> Json<Value> {
    success(solver::solve_dependencies(
        &payload.catalog,
        &payload.extra_constraints,
        payload.limit,
    ))
}

async fn solver_explain(Json(payload): Json<SolvePayload>) -> Json<Value> {
    match solver::explain(&payload.catalog, &payload.extra_constraints) {
        Ok(outcome) => success(outcome),
        Err(e) => failure(e.kind(), e),
    }
}

// ####################################################
//  Load controller
// ####################################################

#[derive(Deserialize)]
struct ServicePayload {
    service: Service,
}

async fn load_monitor(
    State(state): State<AppState>,
    Json(payload): Json<ServicePayload>,
) -> Json<Value> {
    match state.load.monitor_service(&payload.service).await {
        Ok(()) => success(Value::Null),
        Err(e) => failure(e.kind(), e),
    }
}

#[derive(Deserialize)]
struct ServiceNamePayload {
    service_name: String,
}

async fn load_unmonitor(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    state.load.unmonitor_service(&payload.service_name).await;
    success(Value::Null)
}

async fn load_list(State(state): State<AppState>) -> Json<Value> {
    success(state.load.list_services().await)
}

// ####################################################
//  Planner
// ####################################################

async fn planner_list_catalog(State(state): State<AppState>) -> Json<Value> {
    success(state.planner.list_catalog().await)
}

#[derive(Deserialize)]
struct PhasePayload {
    phase: BTreeMap<String, String>,
}

async fn planner_explain_phase(
    State(state): State<AppState>,
    Json(payload): Json<PhasePayload>,
) -> Json<Value> {
    match state.planner.explain_phase(&payload.phase).await {
        Ok(outcome) => success(outcome),
        Err(e) => failure(e.kind(), e),
    }
}

async fn planner_resolve(State(state): State<AppState>) -> Json<Value> {
    success(state.planner.resolve_upgrade_and_steps().await)
}

async fn planner_run_upgrade(State(state): State<AppState>) -> Json<Value> {
    match state.planner.run_available_upgrade().await {
        Ok(schedule) => success(schedule),
        Err(e) => failure(e.kind(), e),
    }
}

async fn planner_history(State(state): State<AppState>) -> Json<Value> {
    success(state.planner.version_history().await)
}

async fn planner_schedules(State(state): State<AppState>) -> Json<Value> {
    success(state.planner.schedules().await)
}

// ####################################################
//  Orchestrator
// ####################################################

async fn orchestrator_monitor(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    match state.orchestrator.monitor(&payload.service_name).await {
        Ok(service) => success(service),
        Err(e) => failure(e.kind(), e),
    }
}

async fn orchestrator_unmonitor(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    match state.orchestrator.unmonitor(&payload.service_name).await {
        Ok(()) => success(Value::Null),
        Err(e) => failure(e.kind(), e),
    }
}

async fn orchestrator_get(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    success(state.orchestrator.get(&payload.service_name).await)
}

async fn orchestrator_list(State(state): State<AppState>) -> Json<Value> {
    success(state.orchestrator.list_service().await)
}

#[derive(Deserialize)]
struct ScalePayload {
    service_name: String,
    scale: u64,
}

async fn orchestrator_scale(
    State(state): State<AppState>,
    Json(payload): Json<ScalePayload>,
) -> Json<Value> {
    match state
        .orchestrator
        .scale(&payload.service_name, payload.scale)
        .await
    {
        Ok(()) => success(Value::Null),
        Err(e) => failure(e.kind(), e),
    }
}

#[derive(Deserialize)]
struct UpgradePayload {
    service_name: String,
    image: UpgradeImage,
}

async fn orchestrator_upgrade(
    State(state): State<AppState>,
    Json(payload): Json<UpgradePayload>,
) -> Json<Value> {
    match state
        .orchestrator
        .upgrade_service(&payload.service_name, &payload.image)
        .await
    {
        Ok(()) => success(Value::Null),
        Err(e) => failure(e.kind(), e),
    }
}

async fn orchestrator_best_scale(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    match state
        .orchestrator
        .get_best_scale(&payload.service_name)
        .await
    {
        Ok(best) => success(best),
        Err(e) => failure(e.kind(), e),
    }
}

async fn orchestrator_reload(
    State(state): State<AppState>,
    Json(payload): Json<ServiceNamePayload>,
) -> Json<Value> {
    match state
        .orchestrator
        .reload_from_platform(&payload.service_name)
        .await
    {
        Ok(service) => success(service),
        Err(e) => failure(e.kind(), e),
    }
}
