//! Container-registry tag listing, used by the periodic reconciliation
//! sweep to spot tags that were pushed or cleaned while no webhook fired.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::prelude::*;
use oci_distribution::{Client as OciClient, Reference, secrets::RegistryAuth};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Anything that can enumerate the tags currently present for an image.
/// The orchestrator's reconciliation sweep depends on this seam so tests can
/// fake a registry.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn list_tags(&self, image: &str) -> Result<Vec<String>>;
}

/// Docker config.json structure
#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Credentials for a specific registry
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Loads registry credentials from a mounted docker `config.json` (the
/// `docker login` credential store) and caches them per registry host.
pub struct AuthManager {
    config_path: PathBuf,
    credentials_cache: HashMap<String, RegistryCredentials>,
}

impl AuthManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            credentials_cache: HashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        let home = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
                PathBuf::from(home).join(".docker")
            });
        Self::new(home.join("config.json"))
    }

    pub async fn auth_for_registry(&mut self, registry: &str) -> RegistryAuth {
        if let Some(creds) = self.credentials_cache.get(registry) {
            return RegistryAuth::Basic(creds.username.clone(), creds.password.clone());
        }
        match self.load_credentials(registry).await {
            Ok(Some(creds)) => {
                let auth = RegistryAuth::Basic(creds.username.clone(), creds.password.clone());
                self.credentials_cache.insert(registry.to_string(), creds);
                auth
            }
            Ok(None) => {
                debug!("no credentials found for {}, using anonymous", registry);
                RegistryAuth::Anonymous
            }
            Err(e) => {
                warn!("error loading credentials for {}: {}", registry, e);
                RegistryAuth::Anonymous
            }
        }
    }

    async fn load_credentials(&self, registry: &str) -> Result<Option<RegistryCredentials>> {
        let raw = match tokio::fs::read_to_string(&self.config_path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let config: DockerConfig =
            serde_json::from_str(&raw).context("invalid docker config.json")?;

        // entries may be keyed with or without a scheme
        let with_scheme = format!("https://{}", registry);
        let entry = config
            .auths
            .get(registry)
            .or_else(|| config.auths.get(&with_scheme));
        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if !entry.username.is_empty() {
            return Ok(Some(RegistryCredentials {
                username: entry.username.clone(),
                password: entry.password.clone(),
            }));
        }
        if entry.auth.is_empty() {
            return Ok(None);
        }
        let decoded = BASE64_STANDARD
            .decode(&entry.auth)
            .context("auth entry is not valid base64")?;
        let decoded = String::from_utf8(decoded).context("auth entry is not valid utf-8")?;
        let (username, password) = decoded
            .split_once(':')
            .context("auth entry is not 'user:password'")?;
        Ok(Some(RegistryCredentials {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }
}

/// Tag-listing client over the OCI distribution API.
pub struct RegistryClient {
    auth_manager: RwLock<AuthManager>,
}

impl RegistryClient {
    pub fn new(auth_manager: AuthManager) -> Self {
        Self {
            auth_manager: RwLock::new(auth_manager),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AuthManager::from_env())
    }

    /// List every tag currently present for `image` (an `image_id` like
    /// `localhost:5000/bosun`, without tag).
    async fn fetch_tags(&self, image: &str) -> Result<Vec<String>> {
        let reference = Reference::try_from(image).context("unparseable image reference")?;
        let client = OciClient::new(Default::default());

        let auth = {
            let mut auth_manager = self.auth_manager.write().await;
            auth_manager.auth_for_registry(reference.registry()).await
        };

        let response = client
            .list_tags(&reference, &auth, None, None)
            .await
            .with_context(|| format!("listing tags for {}", image))?;
        Ok(response.tags)
    }
}

#[async_trait]
impl TagSource for RegistryClient {
    async fn list_tags(&self, image: &str) -> Result<Vec<String>> {
        self.fetch_tags(image).await
    }
}
