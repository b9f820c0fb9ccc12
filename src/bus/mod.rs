//! Event fan-out between components.
//!
//! Each component owns a bounded mailbox; the bus clones every published
//! event to all subscribers and awaits when a mailbox is full, so a slow
//! consumer backpressures its producers instead of dropping events.

use crate::models::{
    ImagePushEvent, ImageVersion, MetricSample, RulesetKey, ScaleConfig, Service, ServiceDiff,
    VersionInfo,
};
use crate::platform::ServiceData;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Event {
    /// A monitorer published fresh metrics.
    MetricsUpdated(MetricSample),
    /// A ruleset's computed results changed.
    RulesetTriggered {
        ruleset: RulesetKey,
        rules_stats: BTreeMap<String, bool>,
    },
    /// The orchestrator observed (and diffed) a service change.
    ServiceUpdated {
        service: Service,
        diff: ServiceDiff,
    },
    /// Raw platform notification, before diffing.
    PlatformServiceUpdated {
        service: ServiceData,
        attributes: BTreeMap<String, String>,
    },
    /// A registry push came in through the webhook.
    ImagePushed(ImagePushEvent),
    /// A new image version is available for a monitored service.
    NewImage {
        service: Service,
        image: ImageVersion,
        scale_config: Option<ScaleConfig>,
    },
    /// A previously observed tag disappeared from the registry.
    CleanedImage {
        service: String,
        image: ImageVersion,
    },
    /// The planner recorded a catalog version it had not seen before.
    NewVersion {
        service: String,
        new: VersionInfo,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MetricsUpdated(_) => "metrics_updated",
            Event::RulesetTriggered { .. } => "ruleset_triggered",
            Event::ServiceUpdated { .. } => "service_updated",
            Event::PlatformServiceUpdated { .. } => "platform_service_updated",
            Event::ImagePushed(_) => "image_updated",
            Event::NewImage { .. } => "new_image",
            Event::CleanedImage { .. } => "cleaned_image",
            Event::NewVersion { .. } => "new_version",
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new mailbox with the given capacity.
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Deliver an event to every subscriber, dropping mailboxes whose
    /// receiver is gone. Sends run concurrently so one full mailbox does
    /// not delay the others, but publish still awaits them all.
    pub async fn publish(&self, event: Event) {
        debug!("publishing event '{}'", event.name());
        let subscribers = self.subscribers.read().await.clone();
        let sends = subscribers
            .iter()
            .map(|subscriber| subscriber.send(event.clone()));
        let results = futures::future::join_all(sends).await;
        if results.iter().any(|result| result.is_err()) {
            self.subscribers
                .write()
                .await
                .retain(|subscriber| !subscriber.is_closed());
        }
    }
}
