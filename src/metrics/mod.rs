use anyhow::Result;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tracing::info;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Webhook metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "bosun_webhook_events_total",
        "Total number of webhook events received"
    ).unwrap();

    pub static ref WEBHOOK_EVENTS_PROCESSED: IntCounter = IntCounter::new(
        "bosun_webhook_events_processed",
        "Total number of webhook events successfully processed"
    ).unwrap();

    // Trigger metrics
    pub static ref METRIC_SAMPLES_TOTAL: IntCounter = IntCounter::new(
        "bosun_metric_samples_total",
        "Total number of metric samples routed to the trigger engine"
    ).unwrap();

    pub static ref RULESETS_TRIGGERED_TOTAL: IntCounter = IntCounter::new(
        "bosun_rulesets_triggered_total",
        "Total number of ruleset_triggered events emitted"
    ).unwrap();

    pub static ref RULESETS_ACTIVE: IntGauge = IntGauge::new(
        "bosun_rulesets_active",
        "Number of registered rulesets"
    ).unwrap();

    // Load controller metrics
    pub static ref SCALE_OPERATIONS_TOTAL: IntCounter = IntCounter::new(
        "bosun_scale_operations_total",
        "Total number of scale commands issued"
    ).unwrap();

    pub static ref SWEEP_REEXECUTIONS_TOTAL: IntCounter = IntCounter::new(
        "bosun_sweep_reexecutions_total",
        "Total number of rulesets re-executed by the periodic sweep"
    ).unwrap();

    // Solver metrics
    pub static ref SOLVER_RUNS_TOTAL: IntCounter = IntCounter::new(
        "bosun_solver_runs_total",
        "Total number of dependency solver invocations"
    ).unwrap();

    pub static ref SOLVER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bosun_solver_duration_seconds",
            "Time spent enumerating compatible assignments"
        ).buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0])
    ).unwrap();

    // Planner metrics
    pub static ref UPGRADES_STARTED_TOTAL: IntCounter = IntCounter::new(
        "bosun_upgrades_started_total",
        "Total number of upgrade schedules started"
    ).unwrap();

    pub static ref UPGRADE_STEPS_TOTAL: IntCounter = IntCounter::new(
        "bosun_upgrade_steps_total",
        "Total number of upgrade steps issued"
    ).unwrap();

    pub static ref SCHEDULES_ABORTED_TOTAL: IntCounter = IntCounter::new(
        "bosun_schedules_aborted_total",
        "Total number of upgrade schedules aborted"
    ).unwrap();

    // Orchestrator metrics
    pub static ref SERVICES_MONITORED: IntGauge = IntGauge::new(
        "bosun_services_monitored",
        "Number of services currently monitored"
    ).unwrap();

    pub static ref RECONCILE_CYCLES_TOTAL: IntCounter = IntCounter::new(
        "bosun_reconcile_cycles_total",
        "Total number of registry reconciliation cycles"
    ).unwrap();

    pub static ref RECONCILE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "bosun_reconcile_errors_total",
        "Total number of registry reconciliation errors"
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_PROCESSED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(METRIC_SAMPLES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(RULESETS_TRIGGERED_TOTAL.clone()))
        .ok();
    REGISTRY.register(Box::new(RULESETS_ACTIVE.clone())).ok();
    REGISTRY
        .register(Box::new(SCALE_OPERATIONS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(SWEEP_REEXECUTIONS_TOTAL.clone()))
        .ok();
    REGISTRY.register(Box::new(SOLVER_RUNS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SOLVER_DURATION.clone())).ok();
    REGISTRY
        .register(Box::new(UPGRADES_STARTED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(UPGRADE_STEPS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(SCHEDULES_ABORTED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(SERVICES_MONITORED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(RECONCILE_CYCLES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(RECONCILE_ERRORS_TOTAL.clone()))
        .ok();

    info!("Metrics registered");
}

pub async fn start_metrics_server(addr: &str) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check));

    info!("Starting metrics server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Metrics server failed");
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buffer,
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
