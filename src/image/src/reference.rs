//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1` into structured components.
//! Parsing is purely lexical: nothing here talks to a registry.

use oci_distribution::Reference;
use strata_core::error::{Result, StrataError};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host that actually serves the Docker Hub registry API.
const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Maximum tag length accepted by registries.
const MAX_TAG_LEN: usize = 128;

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `localhost:5000/image` → localhost:5000/image:latest
    ///
    /// Every component is validated against the distribution grammar, so a
    /// reference that parses here is accepted by the registry client.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StrataError::ReferenceError(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(StrataError::ReferenceError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(ref tag) = tag {
            if !is_valid_tag(tag) {
                return Err(StrataError::ReferenceError(format!(
                    "Invalid tag '{}' in reference '{}'",
                    tag, reference
                )));
            }
        }

        // Determine registry and repository
        let (registry, repository) = Self::split_registry_repository(name)?;

        if !is_valid_registry(&registry) {
            return Err(StrataError::ReferenceError(format!(
                "Invalid registry '{}' in reference '{}'",
                registry, reference
            )));
        }
        if !repository.split('/').all(is_valid_path_component) {
            return Err(StrataError::ReferenceError(format!(
                "Invalid repository '{}' in reference '{}': \
                 components must be lowercase alphanumerics separated by '.', '_', '__' or '-'",
                repository, reference
            )));
        }

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        if name.is_empty() {
            return Err(StrataError::ReferenceError(
                "Empty repository name".to_string(),
            ));
        }

        // The first component is a registry hostname if it contains a dot or
        // colon, or is "localhost"
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(StrataError::ReferenceError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        // No registry component, use the default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Host (and port) serving the registry API for this reference.
    pub fn registry_endpoint(&self) -> &str {
        match self.registry.as_str() {
            "docker.io" | "index.docker.io" => DOCKER_HUB_ENDPOINT,
            other => other,
        }
    }

    /// Convert to an oci-distribution Reference.
    ///
    /// A digest takes precedence over a tag; a reference with neither is
    /// resolved to `latest`.
    pub fn to_oci_reference(&self) -> Result<Reference> {
        let ref_str = if let Some(ref digest) = self.digest {
            format!("{}/{}@{}", self.registry, self.repository, digest)
        } else {
            format!(
                "{}/{}:{}",
                self.registry,
                self.repository,
                self.tag.as_deref().unwrap_or(DEFAULT_TAG)
            )
        };

        ref_str.parse::<Reference>().map_err(|e| {
            StrataError::ReferenceError(format!("Invalid OCI reference '{}': {}", ref_str, e))
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name[:tag]`, where the tag colon must come after the last `/`.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
        }
        None => (name_tag, None),
    }
}

fn is_lower_alnum(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

/// Repository path component: `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_valid_path_component(component: &str) -> bool {
    if !component.starts_with(is_lower_alnum) || !component.ends_with(is_lower_alnum) {
        return false;
    }

    let mut separator = String::new();
    for c in component.chars() {
        if is_lower_alnum(c) {
            if !separator.is_empty() && !is_valid_separator(&separator) {
                return false;
            }
            separator.clear();
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }
    true
}

fn is_valid_separator(separator: &str) -> bool {
    matches!(separator, "." | "_" | "__") || separator.chars().all(|c| c == '-')
}

/// Tag: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Digest: `algorithm:encoded`; sha256 digests must be 64 lowercase hex chars.
fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };

    let algorithm_ok = algorithm.starts_with(is_lower_alnum)
        && algorithm.ends_with(is_lower_alnum)
        && algorithm
            .chars()
            .all(|c| is_lower_alnum(c) || matches!(c, '+' | '.' | '_' | '-'));
    if !algorithm_ok || encoded.is_empty() {
        return false;
    }

    if algorithm == "sha256" {
        encoded.len() == 64 && encoded.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    } else {
        encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-'))
    }
}

/// Registry: `host[:port]` with an alphanumeric/dot/dash host.
fn is_valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };

    let host_ok = !host.is_empty()
        && !host.starts_with(['.', '-'])
        && !host.ends_with(['.', '-'])
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    let port_ok = port.map_or(true, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

    host_ok && port_ok
}
