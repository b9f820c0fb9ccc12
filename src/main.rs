mod api;
mod bus;
mod config;
mod expr;
mod load;
mod metrics;
mod models;
mod monitorer;
mod orchestrator;
mod planner;
mod platform;
mod registry;
mod solver;
mod store;
mod trigger;
mod webhook;

use crate::api::AppState;
use crate::bus::EventBus;
use crate::config::Config;
use crate::load::LoadController;
use crate::monitorer::RestMonitorer;
use crate::orchestrator::Orchestrator;
use crate::planner::UpgradePlanner;
use crate::platform::RestPlatform;
use crate::registry::RegistryClient;
use crate::trigger::TriggerEngine;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "bosun=info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Bosun - fleet auto-scaling and auto-upgrading orchestrator");

    let config = Config::from_env();
    let deadline = Duration::from_secs(config.call_deadline);

    let bus = EventBus::new();
    let platform = Arc::new(RestPlatform::new(&config.platform_url, deadline));
    let monitorer = Arc::new(RestMonitorer::new(&config.monitorer_url, deadline));
    let registry = Arc::new(RegistryClient::from_env());

    // Components, leaves first
    let trigger = Arc::new(TriggerEngine::new(bus.clone(), monitorer));
    let orchestrator = Arc::new(Orchestrator::new(platform, registry, bus.clone()));
    let load = Arc::new(LoadController::new(
        trigger.clone(),
        orchestrator.clone(),
        Duration::from_secs(config.sweep_interval),
        config.stale_after as i64,
    ));
    let planner = Arc::new(UpgradePlanner::new(
        orchestrator.clone(),
        bus.clone(),
        config.solver_limit,
    ));

    // Mailboxes, subscribed before anything can publish
    let trigger_rx = bus.subscribe(config.mailbox_capacity).await;
    let orchestrator_rx = bus.subscribe(config.mailbox_capacity).await;
    let load_rx = bus.subscribe(config.mailbox_capacity).await;
    let planner_rx = bus.subscribe(config.mailbox_capacity).await;

    // Startup work: monitor what is already running, heal the catalog
    orchestrator.bootstrap().await;
    planner.sanity_check().await;

    let trigger_handle = tokio::spawn(trigger.clone().run(trigger_rx));
    let orchestrator_handle = tokio::spawn(
        orchestrator
            .clone()
            .run(orchestrator_rx, Duration::from_secs(config.reconcile_interval)),
    );
    let load_handle = tokio::spawn(load.clone().run(load_rx));
    let planner_handle = tokio::spawn(planner.clone().run(planner_rx));

    // HTTP surfaces
    let metrics_handle = metrics::start_metrics_server(&config.metrics_addr).await?;
    let webhook_handle = webhook::start_webhook_server(&config.webhook_addr, bus.clone()).await?;
    let rpc_handle = api::start_rpc_server(
        &config.rpc_addr,
        AppState {
            trigger,
            load,
            planner,
            orchestrator,
        },
    )
    .await?;

    info!("Bosun is running");

    // Wait for all services
    tokio::select! {
        _ = metrics_handle => info!("Metrics server stopped"),
        _ = webhook_handle => info!("Webhook server stopped"),
        _ = rpc_handle => info!("RPC server stopped"),
        _ = trigger_handle => info!("Trigger engine stopped"),
        _ = orchestrator_handle => info!("Orchestrator stopped"),
        _ = load_handle => info!("Load controller stopped"),
        _ = planner_handle => info!("Upgrade planner stopped"),
    }

    Ok(())
}
