//! Event ingress.
//!
//! One HTTP endpoint accepts registry push notifications in both the
//! private-registry shape (`{"events": [...]}`) and the Docker Hub shape
//! (`{"push_data": ..., "repository": ...}`). The endpoint answers 200 with
//! an empty body unconditionally and dispatches asynchronously; a second
//! route ingests metric samples from monitorers.

use crate::bus::{Event, EventBus};
use crate::metrics::{WEBHOOK_EVENTS_PROCESSED, WEBHOOK_EVENTS_TOTAL};
use crate::models::{
    DockerHubWebhook, ImagePushEvent, MetricSample, QueueMetrics, QueueStats, RegistryWebhook,
};
use anyhow::Result;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct WebhookState {
    bus: EventBus,
}

pub fn router(bus: EventBus) -> Router {
    let state = WebhookState { bus };
    Router::new()
        .route("/event", post(handle_registry_event))
        .route("/ingest/metrics", post(handle_metric_sample))
        .route("/ingest/queue", post(handle_queue_stats))
        .route("/health", axum::routing::get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_webhook_server(addr: &str, bus: EventBus) -> Result<JoinHandle<()>> {
    let app = router(bus);

    info!("Starting webhook server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Webhook server failed");
    });

    Ok(handle)
}

/// Registry notification entry point. Always 200: a registry will retry or
/// drop on error anyway, and a malformed payload is its problem, not ours.
async fn handle_registry_event(
    State(state): State<WebhookState>,
    body: String,
) -> impl IntoResponse {
    WEBHOOK_EVENTS_TOTAL.inc();

    let bus = state.bus.clone();
    tokio::spawn(async move {
        for push in parse_push_events(&body) {
            debug!("dispatching image push {}", push.full_image_id);
            WEBHOOK_EVENTS_PROCESSED.inc();
            bus.publish(Event::ImagePushed(push)).await;
        }
    });

    (StatusCode::OK, "")
}

/// Translate either webhook payload shape into normalized push events.
fn parse_push_events(body: &str) -> Vec<ImagePushEvent> {
    if let Ok(webhook) = serde_json::from_str::<RegistryWebhook>(body) {
        return webhook
            .events
            .iter()
            .filter(|event| event.action == "push")
            .map(ImagePushEvent::from_registry_event)
            .collect();
    }
    if let Ok(webhook) = serde_json::from_str::<DockerHubWebhook>(body) {
        return vec![ImagePushEvent::from_hub(&webhook)];
    }
    warn!("unrecognized webhook payload, ignored");
    Vec::new()
}

async fn handle_metric_sample(
    State(state): State<WebhookState>,
    Json(sample): Json<MetricSample>,
) -> impl IntoResponse {
    let bus = state.bus.clone();
    tokio::spawn(async move {
        bus.publish(Event::MetricsUpdated(sample)).await;
    });
    (StatusCode::OK, "")
}

#[derive(Deserialize)]
struct QueueStatsPayload {
    monitorer: String,
    identifier: String,
    /// `null` for a queue that does not exist
    stats: Option<QueueStats>,
}

/// Raw queue statistics from a management API, normalized into the metric
/// shape the trigger engine consumes.
async fn handle_queue_stats(
    State(state): State<WebhookState>,
    Json(payload): Json<QueueStatsPayload>,
) -> impl IntoResponse {
    let metrics = match &payload.stats {
        Some(stats) => QueueMetrics::from_stats(stats),
        None => QueueMetrics::absent(),
    };
    let sample = MetricSample {
        monitorer: payload.monitorer,
        identifier: payload.identifier,
        metrics: metrics.to_metric_map(),
    };
    let bus = state.bus.clone();
    tokio::spawn(async move {
        bus.publish(Event::MetricsUpdated(sample)).await;
    });
    (StatusCode::OK, "")
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_payload() {
        let body = serde_json::json!({
            "events": [
                {
                    "action": "push",
                    "target": {
                        "digest": "sha256:abc",
                        "repository": "bosun",
                        "tag": "producer-1.0.2"
                    },
                    "request": {"host": "localhost:5000"}
                },
                {
                    "action": "pull",
                    "target": {
                        "digest": "sha256:def",
                        "repository": "bosun",
                        "tag": "producer-1.0.1"
                    },
                    "request": {"host": "localhost:5000"}
                }
            ]
        })
        .to_string();

        let events = parse_push_events(&body);
        // only push actions are handled
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag.as_deref(), Some("producer-1.0.2"));
        assert_eq!(events[0].repository, "localhost:5000");
    }

    #[test]
    fn test_parse_hub_payload() {
        let body = serde_json::json!({
            "push_data": {"tag": "1.25.0"},
            "repository": {"name": "nginx", "namespace": "library"}
        })
        .to_string();

        let events = parse_push_events(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].image, "nginx");
        assert_eq!(events[0].full_image_id, "library/nginx:1.25.0");
    }

    #[test]
    fn test_parse_garbage_payload() {
        assert!(parse_push_events("not even json").is_empty());
        assert!(parse_push_events("{\"unrelated\": true}").is_empty());
    }
}
