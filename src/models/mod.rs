pub mod catalog;
pub mod image;
pub mod metric;
pub mod ruleset;
pub mod service;
pub mod webhook;

pub use catalog::*;
pub use image::{ImageError, ImageVersion, VersionRank, coerce_version, parse_tag, version_rank};
pub use metric::*;
pub use ruleset::*;
pub use service::*;
pub use webhook::{DockerHubWebhook, ImagePushEvent, RegistryWebhook};
