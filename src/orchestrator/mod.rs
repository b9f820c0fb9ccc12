//! Service orchestrator.
//!
//! Owns the monitored service records. Diffs raw platform notifications
//! into `service_updated` events, turns registry pushes into `new_image`
//! events, and exposes the scale/upgrade command surface the load
//! controller and the upgrade planner drive.

use crate::bus::{Event, EventBus};
use crate::metrics::{RECONCILE_CYCLES_TOTAL, RECONCILE_ERRORS_TOTAL, SERVICES_MONITORED};
use crate::models::{
    Change, ImagePushEvent, ImageRef, ImageVersion, ObservedTag, Service, ServiceDiff, ServiceMode,
    StartConfig,
};
use crate::platform::{PlatformAdapter, PlatformError, ServiceData};
use crate::registry::TagSource;
use crate::store::Collection;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Service '{0}' is not monitored")]
    NotMonitored(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NotMonitored(_) => "NotMonitored",
            OrchestratorError::Platform(_) => "PlatformError",
        }
    }
}

/// Target of an upgrade: either an already-pinned image identifier or the
/// full image description from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpgradeImage {
    Id(String),
    Info(ImageVersion),
}

impl UpgradeImage {
    pub fn full_image_id(&self) -> String {
        match self {
            UpgradeImage::Id(id) => id.clone(),
            UpgradeImage::Info(info) => info.unique_image_id(),
        }
    }
}

pub struct Orchestrator {
    services: Collection<String, Service>,
    /// every observed `(repository, image, tag)`
    versions: Collection<String, ObservedTag>,
    platform: Arc<dyn PlatformAdapter>,
    registry: Arc<dyn TagSource>,
    bus: EventBus,
}

impl Orchestrator {
    pub fn new(
        platform: Arc<dyn PlatformAdapter>,
        registry: Arc<dyn TagSource>,
        bus: EventBus,
    ) -> Self {
        Self {
            services: Collection::new("services"),
            versions: Collection::new("versions"),
            platform,
            registry,
            bus,
        }
    }

    /// Event loop plus the periodic registry reconciliation. The sweep runs
    /// inline with the mailbox, so a tick can never overlap its predecessor.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Event>, reconcile_interval: Duration) {
        info!("Orchestrator started");
        let mut ticker = tokio::time::interval(reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Event::PlatformServiceUpdated { service, attributes } => {
                            self.on_platform_service_updated(&service, &attributes).await;
                        }
                        Event::ImagePushed(push) => {
                            self.on_image_pushed(&push).await;
                        }
                        Event::ServiceUpdated { service, diff } => {
                            self.on_own_service_updated(&service, &diff).await;
                        }
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    self.reconcile_registry().await;
                }
            }
        }
        warn!("Orchestrator mailbox closed");
    }

    /// Monitor every service already running on the platform. Called once at
    /// startup when the store is empty.
    pub async fn bootstrap(&self) {
        if !self.services.is_empty().await {
            return;
        }
        let services = match self.platform.list_services().await {
            Ok(services) => services,
            Err(e) => {
                error!("can't list platform services for bootstrap: {}", e);
                return;
            }
        };
        for data in services {
            if let Err(e) = self.monitor(&data.name).await {
                error!("bootstrap: can't monitor {}: {}", data.name, e);
            }
        }
    }

    // ####################################################
    //  RPC surface
    // ####################################################

    /// Fetch the current state and scale_config from the platform and start
    /// monitoring the service. Emits `service_updated` with an empty diff.
    pub async fn monitor(&self, service_name: &str) -> Result<Service, OrchestratorError> {
        if self.services.contains(&service_name.to_string()).await {
            warn!("ask for monitoring an already registered service {}", service_name);
        }

        let data = self.platform.get(service_name).await?;
        let scale_config = self.platform.fetch_image_config(&data.full_image_id).await?;

        let service = Service {
            name: service_name.to_string(),
            image: ImageRef {
                info: data.image_version(),
                full_image_id: data.full_image_id.clone(),
            },
            scale_config,
            mode: data.mode.clone(),
            start_config: StartConfig {
                env: data.envs.clone(),
                secrets: Vec::new(),
            },
        };
        self.services
            .upsert(service_name.to_string(), service.clone())
            .await;
        SERVICES_MONITORED.set(self.services.len().await as i64);

        self.bus
            .publish(Event::ServiceUpdated {
                service: service.clone(),
                diff: ServiceDiff::default(),
            })
            .await;
        Ok(service)
    }

    pub async fn unmonitor(&self, service_name: &str) -> Result<(), OrchestratorError> {
        self.services
            .remove(&service_name.to_string())
            .await
            .ok_or_else(|| OrchestratorError::NotMonitored(service_name.to_string()))?;
        SERVICES_MONITORED.set(self.services.len().await as i64);
        Ok(())
    }

    pub async fn get(&self, service_name: &str) -> Option<Service> {
        self.services.get(&service_name.to_string()).await
    }

    pub async fn list_service(&self) -> Vec<Service> {
        self.services.list().await
    }

    /// Ask the platform to rescale a monitored service.
    pub async fn scale(&self, service_name: &str, scale: u64) -> Result<(), OrchestratorError> {
        if !self.services.contains(&service_name.to_string()).await {
            return Err(OrchestratorError::NotMonitored(service_name.to_string()));
        }
        info!("scaling {} to {}", service_name, scale);
        self.platform
            .update(service_name, None, Some(scale))
            .await?;
        Ok(())
    }

    /// Ask the platform to move a monitored service to another image.
    pub async fn upgrade_service(
        &self,
        service_name: &str,
        image: &UpgradeImage,
    ) -> Result<(), OrchestratorError> {
        if !self.services.contains(&service_name.to_string()).await {
            return Err(OrchestratorError::NotMonitored(service_name.to_string()));
        }
        let image_id = image.full_image_id();
        info!("upgrading {} to {}", service_name, image_id);
        self.platform
            .update(service_name, Some(&image_id), None)
            .await?;
        Ok(())
    }

    /// Clamp the current replica count into the service's `[min, max]`
    /// bounds. `None` for non-replicated services.
    pub async fn get_best_scale(
        &self,
        service_name: &str,
    ) -> Result<Option<(u64, u64)>, OrchestratorError> {
        let service = self
            .get(service_name)
            .await
            .ok_or_else(|| OrchestratorError::NotMonitored(service_name.to_string()))?;
        Ok(best_scale(&service, 0))
    }

    /// Reload the service state and its image's scale_config from the
    /// platform, re-running the usual diff pipeline on what comes back.
    pub async fn reload_from_platform(
        &self,
        service_name: &str,
    ) -> Result<Service, OrchestratorError> {
        if !self.services.contains(&service_name.to_string()).await {
            return Err(OrchestratorError::NotMonitored(service_name.to_string()));
        }
        let data = self.platform.get(service_name).await?;
        self.on_platform_service_updated(&data, &BTreeMap::new())
            .await;
        self.refresh_scale_config(service_name, &data.full_image_id)
            .await;
        self.get(service_name)
            .await
            .ok_or_else(|| OrchestratorError::NotMonitored(service_name.to_string()))
    }

    // ####################################################
    //  Event handling
    // ####################################################

    /// Diff a raw platform notification against the stored record, persist
    /// the new image and mode, and re-emit when something changed.
    pub async fn on_platform_service_updated(
        &self,
        data: &ServiceData,
        attributes: &BTreeMap<String, String>,
    ) {
        let Some(stored) = self.services.get(&data.name).await else {
            debug!("ignoring update for unmonitored service {}", data.name);
            return;
        };

        let new_image = data.image_version();
        let mut diff = ServiceDiff::default();

        if let (
            ServiceMode::Replicated { replicas: old },
            ServiceMode::Replicated { replicas: new },
        ) = (&stored.mode, &data.mode)
            && old != new
        {
            diff.scale = Some(Change {
                from: Some(*old),
                to: *new,
            });
        }
        if stored.mode.kind() != data.mode.kind() {
            diff.mode = Some(Change {
                from: Some(stored.mode.kind().to_string()),
                to: data.mode.kind().to_string(),
            });
        }
        if new_image != stored.image.info {
            diff.image = Some(Change {
                from: Some(stored.image.info.clone()),
                to: new_image.clone(),
            });
        }
        if let Some(to) = attributes.get("updatestate.new") {
            diff.state = Some(Change {
                from: attributes.get("updatestate.old").cloned(),
                to: to.clone(),
            });
        }

        let mode = data.mode.clone();
        let image = ImageRef {
            info: new_image,
            full_image_id: data.full_image_id.clone(),
        };
        self.services
            .update(&data.name, |service| {
                service.mode = mode.clone();
                service.image = image.clone();
            })
            .await;

        if diff.is_empty() {
            return;
        }
        let Some(service) = self.services.get(&data.name).await else {
            return;
        };
        self.bus
            .publish(Event::ServiceUpdated { service, diff })
            .await;
    }

    /// Scale-config refresh: when our own diff reports an image change,
    /// fetch the new image's scale_config and re-emit if it differs.
    async fn on_own_service_updated(&self, service: &Service, diff: &ServiceDiff) {
        if diff.image.is_none() {
            return;
        }
        self.refresh_scale_config(&service.name, &service.image.full_image_id)
            .await;
    }

    async fn refresh_scale_config(&self, service_name: &str, full_image_id: &str) {
        let new_config = match self.platform.fetch_image_config(full_image_id).await {
            Ok(config) => config,
            Err(e) => {
                error!("can't fetch scale_config for {}: {}", full_image_id, e);
                return;
            }
        };
        let Some(new_config) = new_config else {
            return;
        };
        let Some(stored) = self.services.get(&service_name.to_string()).await else {
            return;
        };
        if stored.scale_config.as_ref() == Some(&new_config) {
            return;
        }

        debug!("updated scale config for {}", service_name);
        self.services
            .update(&service_name.to_string(), |service| {
                service.scale_config = Some(new_config.clone());
            })
            .await;
        let Some(service) = self.services.get(&service_name.to_string()).await else {
            return;
        };
        self.bus
            .publish(Event::ServiceUpdated {
                service,
                diff: ServiceDiff {
                    scale_config: Some(new_config),
                    ..Default::default()
                },
            })
            .await;
    }

    /// New-image pipeline: record the tag, locate monitored services running
    /// the same image, and emit `new_image` for each. Services that opted
    /// out of auto updates do not participate.
    pub async fn on_image_pushed(&self, push: &ImagePushEvent) {
        let Some(tag) = &push.tag else {
            debug!("push event without a tag for {}, ignored", push.image);
            return;
        };
        let image =
            ImageVersion::from_tag(&push.repository, &push.image, tag, push.digest.as_deref());

        let observed = ObservedTag {
            repository: push.repository.clone(),
            image: push.image.clone(),
            tag: tag.clone(),
            date: Utc::now(),
        };
        self.versions.upsert(observed.key(), observed).await;

        let image_id = image.image_id();
        for service in self.services.list().await {
            if service.image.info.image_id() != image_id {
                continue;
            }
            if service.image.full_image_id == push.full_image_id {
                debug!("service {} already runs the notified image", service.name);
                continue;
            }
            if let Some(config) = &service.scale_config
                && !config.auto_update
            {
                debug!("service {} has auto_update disabled, skipping", service.name);
                continue;
            }

            let scale_config = match self.platform.fetch_image_config(&push.full_image_id).await {
                Ok(config) => config,
                Err(e) => {
                    error!(
                        "error while fetching image config for {}: {}",
                        push.full_image_id, e
                    );
                    None
                }
            };
            self.bus
                .publish(Event::NewImage {
                    service,
                    image: image.clone(),
                    scale_config,
                })
                .await;
        }
    }

    // ####################################################
    //  Registry reconciliation
    // ####################################################

    /// Compare the registry's tag list against the versions store for every
    /// monitored image. New tags are fed into the new-image pipeline;
    /// vanished tags produce `cleaned_image` events.
    pub async fn reconcile_registry(&self) {
        RECONCILE_CYCLES_TOTAL.inc();

        let services = self.services.list().await;
        let mut images: BTreeMap<(String, String), Vec<Service>> = BTreeMap::new();
        for service in services {
            let info = &service.image.info;
            images
                .entry((info.repository.clone(), info.image.clone()))
                .or_default()
                .push(service);
        }

        for ((repository, image), services) in images {
            let reference = if repository.is_empty() {
                image.clone()
            } else {
                format!("{}/{}", repository, image)
            };
            let live_tags: BTreeSet<String> = match self.registry.list_tags(&reference).await {
                Ok(tags) => tags.into_iter().collect(),
                Err(e) => {
                    RECONCILE_ERRORS_TOTAL.inc();
                    warn!("can't list registry tags for {}: {}", reference, e);
                    continue;
                }
            };

            let stored: Vec<ObservedTag> = self
                .versions
                .list()
                .await
                .into_iter()
                .filter(|row| row.repository == repository && row.image == image)
                .collect();
            let stored_tags: BTreeSet<String> =
                stored.iter().map(|row| row.tag.clone()).collect();

            for tag in live_tags.difference(&stored_tags) {
                debug!("reconciliation found new tag {}:{}", reference, tag);
                let push = ImagePushEvent {
                    repository: repository.clone(),
                    image: image.clone(),
                    tag: Some(tag.clone()),
                    digest: None,
                    full_image_id: format!("{}:{}", reference, tag),
                };
                self.on_image_pushed(&push).await;
            }

            for row in &stored {
                if live_tags.contains(&row.tag) {
                    continue;
                }
                debug!("tag {}:{} disappeared from the registry", reference, row.tag);
                let gone =
                    ImageVersion::from_tag(&row.repository, &row.image, &row.tag, None);
                self.versions.remove(&row.key()).await;
                for service in &services {
                    if service.image.info.image_id() == gone.image_id() {
                        self.bus
                            .publish(Event::CleanedImage {
                                service: service.name.clone(),
                                image: gone.clone(),
                            })
                            .await;
                    }
                }
            }
        }
    }
}

/// Best replica count for a service: current plus delta, clamped into the
/// scale_config bounds. `None` for non-replicated services.
pub fn best_scale(service: &Service, delta: i64) -> Option<(u64, u64)> {
    clamp_scale(&service.mode, service.scale_config.as_ref(), delta)
}

pub fn clamp_scale(
    mode: &ServiceMode,
    scale_config: Option<&crate::models::ScaleConfig>,
    delta: i64,
) -> Option<(u64, u64)> {
    let ServiceMode::Replicated { replicas } = mode else {
        return None;
    };
    let current = *replicas;
    let (min, max) = match scale_config {
        Some(config) => (config.min, config.max),
        None => (0, current.max(1)),
    };
    let best = (current as i64 + delta).max(0) as u64;
    let best = best.clamp(min, max.max(min));
    Some((current, best))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScaleConfig;

    fn service_with(replicas: u64, min: u64, max: u64) -> Service {
        Service {
            name: "producer".to_string(),
            image: ImageRef {
                info: ImageVersion::from_tag(
                    "localhost:5000",
                    "bosun",
                    "producer-1.0.1",
                    Some("sha256:aaa"),
                ),
                full_image_id: "localhost:5000/bosun:producer-1.0.1@sha256:aaa".to_string(),
            },
            scale_config: Some(ScaleConfig {
                min,
                max,
                ..Default::default()
            }),
            mode: ServiceMode::Replicated { replicas },
            start_config: StartConfig::default(),
        }
    }

    #[test]
    fn test_best_scale_clamps() {
        assert_eq!(best_scale(&service_with(3, 0, 9), -1), Some((3, 2)));
        assert_eq!(best_scale(&service_with(3, 0, 9), 1), Some((3, 4)));
        assert_eq!(best_scale(&service_with(9, 0, 9), 1), Some((9, 9)));
        assert_eq!(best_scale(&service_with(0, 0, 9), -1), Some((0, 0)));
        assert_eq!(best_scale(&service_with(0, 2, 9), 0), Some((0, 2)));
    }

    #[test]
    fn test_best_scale_non_replicated() {
        let mut service = service_with(3, 0, 9);
        service.mode = ServiceMode::Global;
        assert_eq!(best_scale(&service, 1), None);
    }

    #[test]
    fn test_upgrade_image_id() {
        let id = UpgradeImage::Id("localhost/bosun:producer-1.0.2".to_string());
        assert_eq!(id.full_image_id(), "localhost/bosun:producer-1.0.2");

        let info = UpgradeImage::Info(ImageVersion::from_tag(
            "localhost",
            "bosun",
            "producer-1.0.2",
            Some("sha256:bbb"),
        ));
        assert_eq!(
            info.full_image_id(),
            "localhost/bosun:producer-1.0.2@sha256:bbb"
        );
    }
}
