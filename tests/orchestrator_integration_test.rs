// Orchestrator tests: diff pipeline, scale-config refresh, new-image
// pipeline and registry reconciliation against mocks.

mod common;

use bosun::bus::{Event, EventBus};
use bosun::models::{ImagePushEvent, ServiceMode};
use bosun::orchestrator::{Orchestrator, UpgradeImage};
use common::{MockPlatform, MockRegistry, full_image_id, scale_config, service_data};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    platform: Arc<MockPlatform>,
    registry: Arc<MockRegistry>,
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::Receiver<Event>,
}

async fn setup() -> Harness {
    let bus = EventBus::new();
    let rx = bus.subscribe(32).await;
    let platform = MockPlatform::new();
    let registry = MockRegistry::new();
    let orchestrator = Arc::new(Orchestrator::new(
        platform.clone(),
        registry.clone(),
        bus,
    ));
    Harness {
        platform,
        registry,
        orchestrator,
        rx,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("an event should have been emitted")
        .expect("bus still open")
}

#[tokio::test]
async fn test_monitor_emits_empty_diff() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness
        .platform
        .insert_config(&data.full_image_id, scale_config(0, 9))
        .await;
    harness.platform.insert_service(data).await;

    let service = harness.orchestrator.monitor("producer").await.unwrap();
    assert_eq!(service.mode, ServiceMode::Replicated { replicas: 3 });
    assert_eq!(service.image.info.species.as_deref(), Some("producer"));
    assert!(service.scale_config.is_some());

    match next_event(&mut harness.rx).await {
        Event::ServiceUpdated { service, diff } => {
            assert_eq!(service.name, "producer");
            assert!(diff.is_empty());
        }
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn test_scale_requires_monitoring() {
    let harness = setup().await;
    let err = harness.orchestrator.scale("ghost", 2).await.unwrap_err();
    assert_eq!(err.kind(), "NotMonitored");

    let err = harness
        .orchestrator
        .upgrade_service("ghost", &UpgradeImage::Id("x".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotMonitored");
}

#[tokio::test]
async fn test_diff_scale_and_state() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data.clone()).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await; // the monitor event

    let mut updated = data;
    updated.mode = ServiceMode::Replicated { replicas: 5 };
    let mut attributes = BTreeMap::new();
    attributes.insert("updatestate.old".to_string(), "updating".to_string());
    attributes.insert("updatestate.new".to_string(), "completed".to_string());

    harness
        .orchestrator
        .on_platform_service_updated(&updated, &attributes)
        .await;

    match next_event(&mut harness.rx).await {
        Event::ServiceUpdated { service, diff } => {
            let scale = diff.scale.expect("scale diff");
            assert_eq!(scale.from, Some(3));
            assert_eq!(scale.to, 5);
            let state = diff.state.expect("state diff");
            assert_eq!(state.to, "completed");
            assert!(diff.image.is_none());
            assert_eq!(service.mode, ServiceMode::Replicated { replicas: 5 });
        }
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn test_diff_image_change() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    let updated = service_data("producer", "1.0.2", 3);
    harness
        .orchestrator
        .on_platform_service_updated(&updated, &BTreeMap::new())
        .await;

    match next_event(&mut harness.rx).await {
        Event::ServiceUpdated { service, diff } => {
            let image = diff.image.expect("image diff");
            assert_eq!(image.to.version.as_deref(), Some("1.0.2"));
            assert_eq!(
                image.from.unwrap().version.as_deref(),
                Some("1.0.1")
            );
            assert_eq!(service.image.full_image_id, full_image_id("producer", "1.0.2"));
        }
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn test_unchanged_update_emits_nothing() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data.clone()).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    harness
        .orchestrator
        .on_platform_service_updated(&data, &BTreeMap::new())
        .await;
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unmonitored_update_is_ignored() {
    let mut harness = setup().await;
    harness
        .orchestrator
        .on_platform_service_updated(&service_data("ghost", "1.0.0", 1), &BTreeMap::new())
        .await;
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reload_refreshes_scale_config() {
    let mut harness = setup().await;
    let v1 = service_data("producer", "1.0.1", 3);
    harness
        .platform
        .insert_config(&v1.full_image_id, scale_config(0, 9))
        .await;
    harness.platform.insert_service(v1).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    // the platform now runs 1.0.2, whose image publishes different bounds
    let v2 = service_data("producer", "1.0.2", 3);
    harness
        .platform
        .insert_config(&v2.full_image_id, scale_config(2, 20))
        .await;
    harness.platform.insert_service(v2).await;

    let reloaded = harness.orchestrator.reload_from_platform("producer").await.unwrap();
    assert_eq!(reloaded.scale_config.as_ref().unwrap().max, 20);
    assert_eq!(reloaded.image.info.version.as_deref(), Some("1.0.2"));

    // one event for the image diff, one for the scale_config refresh
    match next_event(&mut harness.rx).await {
        Event::ServiceUpdated { diff, .. } => assert!(diff.image.is_some()),
        other => panic!("unexpected event {}", other.name()),
    }
    match next_event(&mut harness.rx).await {
        Event::ServiceUpdated { diff, .. } => {
            assert_eq!(diff.scale_config.unwrap().max, 20)
        }
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn test_new_image_pipeline() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    let push = ImagePushEvent {
        repository: "localhost:5000".to_string(),
        image: "bosun".to_string(),
        tag: Some("producer-1.0.2".to_string()),
        digest: Some("sha256:bbb".to_string()),
        full_image_id: "localhost:5000/bosun@sha256:bbb".to_string(),
    };
    harness
        .platform
        .insert_config(&push.full_image_id, scale_config(0, 9))
        .await;
    harness.orchestrator.on_image_pushed(&push).await;

    match next_event(&mut harness.rx).await {
        Event::NewImage {
            service,
            image,
            scale_config,
        } => {
            assert_eq!(service.name, "producer");
            assert_eq!(image.version.as_deref(), Some("1.0.2"));
            assert_eq!(image.species.as_deref(), Some("producer"));
            assert!(scale_config.is_some());
        }
        other => panic!("unexpected event {}", other.name()),
    }
}

#[tokio::test]
async fn test_push_for_other_image_is_ignored() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    // same repository, different species: not our image
    let push = ImagePushEvent {
        repository: "localhost:5000".to_string(),
        image: "bosun".to_string(),
        tag: Some("consumer-1.0.2".to_string()),
        digest: None,
        full_image_id: "localhost:5000/bosun:consumer-1.0.2".to_string(),
    };
    harness.orchestrator.on_image_pushed(&push).await;
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_auto_update_opt_out() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    let mut config = scale_config(0, 9);
    config.auto_update = false;
    harness.platform.insert_config(&data.full_image_id, config).await;
    harness.platform.insert_service(data).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    let push = ImagePushEvent {
        repository: "localhost:5000".to_string(),
        image: "bosun".to_string(),
        tag: Some("producer-1.0.2".to_string()),
        digest: None,
        full_image_id: "localhost:5000/bosun:producer-1.0.2".to_string(),
    };
    harness.orchestrator.on_image_pushed(&push).await;
    assert!(harness.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_registry_reconciliation() {
    let mut harness = setup().await;
    let data = service_data("producer", "1.0.1", 3);
    harness.platform.insert_service(data).await;
    harness.orchestrator.monitor("producer").await.unwrap();
    next_event(&mut harness.rx).await;

    harness
        .registry
        .set_tags(
            "localhost:5000/bosun",
            &["producer-1.0.1", "producer-1.0.2"],
        )
        .await;
    harness.orchestrator.reconcile_registry().await;

    // both tags are new to the versions store; only 1.0.2 is a different
    // image than the one running, but the synthesized push for 1.0.1 also
    // flows through the pipeline (its pinned id differs), so collect what
    // came out and check 1.0.2 is among it
    let mut seen = Vec::new();
    while let Ok(event) = harness.rx.try_recv() {
        if let Event::NewImage { image, .. } = event {
            seen.push(image.version.unwrap());
        }
    }
    assert!(seen.contains(&"1.0.2".to_string()));

    // the registry then drops 1.0.2
    harness
        .registry
        .set_tags("localhost:5000/bosun", &["producer-1.0.1"])
        .await;
    harness.orchestrator.reconcile_registry().await;

    let mut cleaned = Vec::new();
    while let Ok(event) = harness.rx.try_recv() {
        if let Event::CleanedImage { service, image } = event {
            cleaned.push((service, image.version.unwrap()));
        }
    }
    assert_eq!(cleaned, vec![("producer".to_string(), "1.0.2".to_string())]);
}
