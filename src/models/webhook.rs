use serde::{Deserialize, Serialize};

/// Notification payload from a private docker registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryWebhook {
    pub events: Vec<RegistryEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub action: String,
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub digest: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

/// Docker Hub webhook format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubWebhook {
    pub push_data: PushData,
    pub repository: Repository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushData {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pusher: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
}

/// Normalized push notification after parsing either webhook shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePushEvent {
    pub repository: String,
    pub image: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub full_image_id: String,
}

impl ImagePushEvent {
    pub fn from_registry_event(event: &RegistryEvent) -> Self {
        let host = event
            .request
            .as_ref()
            .and_then(|r| r.host.clone())
            .unwrap_or_default();
        let full_image_id = format!("{}/{}@{}", host, event.target.repository, event.target.digest);
        Self {
            repository: host,
            image: event.target.repository.clone(),
            tag: event.target.tag.clone(),
            digest: Some(event.target.digest.clone()),
            full_image_id,
        }
    }

    pub fn from_hub(payload: &DockerHubWebhook) -> Self {
        let full_image_id = format!(
            "{}/{}:{}",
            payload.repository.namespace, payload.repository.name, payload.push_data.tag
        );
        Self {
            repository: payload.repository.namespace.clone(),
            image: payload.repository.name.clone(),
            tag: Some(payload.push_data.tag.clone()),
            digest: None,
            full_image_id,
        }
    }
}
