use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Unparseable version '{version}': {reason}")]
    UnparseableVersion { version: String, reason: String },
}

/// A fully qualified image observation: where it lives, which sub-image of
/// the repository it is (`species`), and which version the tag encodes.
///
/// Tags come in several shapes:
///   "overseer-1.2.3"  -> species "overseer", version "1.2.3"
///   "3.6-alpine"      -> species "alpine",   version "3.6"
///   "3.6.1"           -> no species,         version "3.6.1"
///   "alpine"          -> species "alpine",   no version
///   "latest"          -> no species,         version "latest"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageVersion {
    pub repository: String,
    pub image: String,
    pub tag: String,
    pub species: Option<String>,
    pub version: Option<String>,
    pub digest: Option<String>,
}

/// Comparable form of a version string. `Latest` outranks every parsed
/// version; unparseable text sorts below everything and falls back to
/// lexicographic order on the raw tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionRank {
    Unparseable(String),
    Semver(Version, String),
    Latest,
}

/// Rank a raw version/tag string for newest-first sorting.
pub fn version_rank(raw: &str) -> VersionRank {
    if raw == "latest" {
        return VersionRank::Latest;
    }
    match coerce_version(raw) {
        Ok(v) => VersionRank::Semver(v, raw.to_string()),
        Err(_) => VersionRank::Unparseable(raw.to_string()),
    }
}

/// Parse a docker-style version string into a semver `Version`.
///
/// Accepts `N`, `N.N`, `N.N.N`, an alphanumeric prerelease glued to the last
/// numeral (`1.0.69a1`), and `+build` metadata. Anything else is rejected.
pub fn coerce_version(raw: &str) -> Result<Version, ImageError> {
    let err = |reason: &str| ImageError::UnparseableVersion {
        version: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(err("empty version"));
    }

    let (core, build) = match raw.split_once('+') {
        Some((c, b)) => (c, Some(b)),
        None => (raw, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err(err("more than three dotted components"));
    }

    let mut numbers = [0u64; 3];
    let mut pre = "";
    for (i, part) in parts.iter().enumerate() {
        let digits_end = part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(part.len());
        if digits_end == 0 {
            return Err(err("component does not start with a digit"));
        }
        let rest = &part[digits_end..];
        if !rest.is_empty() {
            // only the last component may carry a prerelease suffix
            if i != parts.len() - 1 {
                return Err(err("non-numeric inner component"));
            }
            pre = rest;
        }
        numbers[i] = part[..digits_end]
            .parse()
            .map_err(|_| err("numeric component out of range"))?;
    }

    Ok(Version {
        major: numbers[0],
        minor: numbers[1],
        patch: numbers[2],
        pre: if pre.is_empty() {
            Prerelease::EMPTY
        } else {
            Prerelease::new(pre).map_err(|_| err("invalid prerelease"))?
        },
        build: match build {
            Some(b) => BuildMetadata::new(b).map_err(|_| err("invalid build metadata"))?,
            None => BuildMetadata::EMPTY,
        },
    })
}

/// Split a tag into its `(species, version)` parts.
pub fn parse_tag(tag: &str) -> (Option<String>, Option<String>) {
    fn version_like(s: &str) -> bool {
        s == "latest" || s.starts_with(|c: char| c.is_ascii_digit())
    }

    if tag.is_empty() {
        return (None, None);
    }
    if version_like(tag) {
        return (None, Some(tag.to_string()));
    }
    // "<species>-<version>" takes the last hyphen so species may themselves
    // contain hyphens; "<version>-<species>" takes the first.
    if let Some((head, rest)) = tag.rsplit_once('-')
        && version_like(rest)
    {
        return (Some(head.to_string()), Some(rest.to_string()));
    }
    if let Some((head, rest)) = tag.split_once('-')
        && version_like(head)
    {
        return (Some(rest.to_string()), Some(head.to_string()));
    }
    (Some(tag.to_string()), None)
}

impl ImageVersion {
    pub fn from_tag(repository: &str, image: &str, tag: &str, digest: Option<&str>) -> Self {
        let (species, version) = parse_tag(tag);
        Self {
            repository: repository.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            species,
            version,
            digest: digest.map(String::from),
        }
    }

    /// Stable identity for "same image": repository/image:species.
    pub fn image_id(&self) -> String {
        let base = if self.repository.is_empty() {
            self.image.clone()
        } else {
            format!("{}/{}", self.repository, self.image)
        };
        match &self.species {
            Some(species) => format!("{}:{}", base, species),
            None => base,
        }
    }

    /// Fully pinned identifier including tag and digest.
    pub fn unique_image_id(&self) -> String {
        let base = if self.repository.is_empty() {
            self.image.clone()
        } else {
            format!("{}/{}", self.repository, self.image)
        };
        let with_tag = if self.tag.is_empty() {
            base
        } else {
            format!("{}:{}", base, self.tag)
        };
        match &self.digest {
            Some(digest) => format!("{}@{}", with_tag, digest),
            None => with_tag,
        }
    }

    pub fn is_latest(&self) -> bool {
        self.version.as_deref() == Some("latest")
    }

    pub fn same_image(&self, other: &Self) -> bool {
        self.repository == other.repository
            && self.image == other.image
            && self.species == other.species
    }

    pub fn parsed_version(&self) -> Option<Result<Version, ImageError>> {
        match self.version.as_deref() {
            None | Some("latest") => None,
            Some(raw) => Some(coerce_version(raw)),
        }
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} version={}",
            self.image_id(),
            self.version.as_deref().unwrap_or("none")
        )
    }
}

impl PartialEq for ImageVersion {
    fn eq(&self, other: &Self) -> bool {
        if !self.same_image(other) {
            return false;
        }
        match (self.is_latest(), other.is_latest()) {
            (true, true) => self.digest == other.digest,
            (true, false) | (false, true) => false,
            (false, false) => match (self.parsed_version(), other.parsed_version()) {
                (Some(Ok(a)), Some(Ok(b))) => a.cmp_precedence(&b) == Ordering::Equal,
                (None, None) => self.tag == other.tag,
                _ => false,
            },
        }
    }
}

impl PartialOrd for ImageVersion {
    /// Defined only between same-image values; `latest` outranks every
    /// parsed version; two `latest` are not ordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.same_image(other) {
            return None;
        }
        match (self.is_latest(), other.is_latest()) {
            (true, true) => None,
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => match (self.parsed_version(), other.parsed_version()) {
                (Some(Ok(a)), Some(Ok(b))) => Some(a.cmp_precedence(&b)),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(tag: &str) -> ImageVersion {
        ImageVersion::from_tag("hub.docker.com", "bosun", tag, Some("sha256:0870f"))
    }

    fn iv_full(tag: &str, image: &str, repository: &str) -> ImageVersion {
        ImageVersion::from_tag(repository, image, tag, Some("sha256:0870f"))
    }

    #[test]
    fn test_parse_public_tags() {
        assert_eq!(parse_tag("3.6.1"), (None, Some("3.6.1".into())));
        assert_eq!(parse_tag("3.6"), (None, Some("3.6".into())));
        assert_eq!(parse_tag("3"), (None, Some("3".into())));
        assert_eq!(parse_tag("latest"), (None, Some("latest".into())));
        assert_eq!(
            parse_tag("3.6-alpine"),
            (Some("alpine".into()), Some("3.6".into()))
        );
        assert_eq!(
            parse_tag("3.6.1-slim_lol"),
            (Some("slim_lol".into()), Some("3.6.1".into()))
        );
        assert_eq!(parse_tag("alpine"), (Some("alpine".into()), None));
        assert_eq!(parse_tag(""), (None, None));
    }

    #[test]
    fn test_parse_private_tags() {
        assert_eq!(
            parse_tag("overseer-1.0.69"),
            (Some("overseer".into()), Some("1.0.69".into()))
        );
        assert_eq!(
            parse_tag("overseer-latest"),
            (Some("overseer".into()), Some("latest".into()))
        );
        assert_eq!(
            parse_tag("scaler_docker-1.0"),
            (Some("scaler_docker".into()), Some("1.0".into()))
        );
        assert_eq!(
            parse_tag("scaler_docker"),
            (Some("scaler_docker".into()), None)
        );
        assert_eq!(
            parse_tag("overseer-1.0.69a1+build45"),
            (Some("overseer".into()), Some("1.0.69a1+build45".into()))
        );
    }

    #[test]
    fn test_coerce_version() {
        assert_eq!(coerce_version("3.6.1").unwrap(), Version::new(3, 6, 1));
        assert_eq!(coerce_version("3.6").unwrap(), Version::new(3, 6, 0));
        assert_eq!(coerce_version("3").unwrap(), Version::new(3, 0, 0));

        let v = coerce_version("1.0.69a1+build45").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 0, 69));
        assert_eq!(v.pre.as_str(), "a1");
        assert_eq!(v.build.as_str(), "build45");

        assert!(coerce_version("").is_err());
        assert!(coerce_version("abc").is_err());
        assert!(coerce_version("1.3.0.119").is_err());
    }

    #[test]
    fn test_image_id() {
        assert_eq!(
            iv_full("alpine", "python", "localhost").image_id(),
            "localhost/python:alpine"
        );
        assert_eq!(
            iv_full("3.6.1-alpine", "python", "localhost").image_id(),
            "localhost/python:alpine"
        );
        assert_eq!(
            iv_full("overseer-1.0.68", "bosun", "localhost").image_id(),
            "localhost/bosun:overseer"
        );
    }

    #[test]
    fn test_unique_image_id() {
        assert_eq!(
            iv_full("3.6.1-alpine", "python", "localhost").unique_image_id(),
            "localhost/python:3.6.1-alpine@sha256:0870f"
        );
        assert_eq!(
            iv_full("overseer", "bosun", "localhost").unique_image_id(),
            "localhost/bosun:overseer@sha256:0870f"
        );
    }

    #[test]
    fn test_equality() {
        assert_eq!(iv("overseer-1.0.68"), iv("overseer-1.0.68"));
        assert_eq!(iv("alpine"), iv("alpine"));
        assert_ne!(iv("alpine"), iv("3-alpine"));
        assert_ne!(
            iv_full("alpine", "python", "localhost"),
            iv_full("alpine", "bosun", "localhost")
        );
        assert_ne!(
            iv_full("alpine", "python", "localhost"),
            iv_full("alpine", "python", "hub.docker.com")
        );
    }

    #[test]
    fn test_ordering() {
        assert!(iv("3.1") < iv("3.2"));
        assert!(iv("3") < iv("3.2"));
        assert!(iv("3.1-alpine") < iv("3.2-alpine"));
        assert!(iv("overseer-3.1.9") < iv("overseer-3.1.76"));
        assert!(iv("overseer-3.1.9a1") < iv("overseer-3.1.76"));
        assert!(iv("overseer-3.1.76a1") < iv("overseer-3.1.76"));
        assert!(iv("overseer-3.1.76b1") > iv("overseer-3.1.76a7"));
        // build metadata does not participate in precedence
        assert_eq!(
            iv("overseer-3.1.9+build1").partial_cmp(&iv("overseer-3.1.9")),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_ordering_different_images_undefined() {
        assert_eq!(iv("overseer-3.1.76").partial_cmp(&iv("trigger")), None);
        assert_eq!(
            iv_full("overseer", "bosun", "localhost")
                .partial_cmp(&iv_full("overseer", "bosun", "hub.docker.com")),
            None
        );
    }

    #[test]
    fn test_latest() {
        assert!(iv("9999") < iv("latest"));
        assert!(iv("overseer-9999") < iv("overseer-latest"));
        assert_eq!(iv("latest").partial_cmp(&iv("latest")), None);

        let a = ImageVersion::from_tag("localhost", "bosun", "latest", Some("aaaa"));
        let b = ImageVersion::from_tag("localhost", "bosun", "latest", Some("aaaa"));
        let c = ImageVersion::from_tag("localhost", "bosun", "latest", Some("bbbb"));
        let d = ImageVersion::from_tag("localhost", "bosun", "1.0", Some("aaaa"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_version_rank_order() {
        assert!(version_rank("latest") > version_rank("9999"));
        assert!(version_rank("1.2.10") > version_rank("1.2.9"));
        assert!(version_rank("1.2.9") > version_rank("weird-tag"));
    }

    #[test]
    fn test_serde_round_trip() {
        let original = iv_full("overseer-1.0.69a1+build45", "bosun", "localhost:5000");
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: ImageVersion = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(original.species, decoded.species);
        assert_eq!(original.version, decoded.version);
        assert_eq!(original.tag, decoded.tag);
    }
}
