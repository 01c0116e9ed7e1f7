//! Blob existence checks against a destination repository.
//!
//! `oci-distribution` always uploads every blob it is handed, so the writer
//! asks the registry first with `HEAD /v2/<repo>/blobs/<digest>`. Registries
//! that answer 401 with a `Bearer` challenge get one token exchange per
//! lookup session.

use std::collections::HashMap;

use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use strata_core::error::{Result, StrataError};

use super::reference::ImageReference;

/// Token endpoint response. Registries return `token`, `access_token`, or
/// both.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Looks up existing blobs in one repository.
pub(crate) struct BlobLookup {
    http: reqwest::Client,
    base_url: String,
    registry: String,
    repository: String,
    credentials: Option<(String, String)>,
    token: Option<String>,
}

impl BlobLookup {
    pub(crate) fn new(
        http: reqwest::Client,
        reference: &ImageReference,
        insecure: bool,
        credentials: Option<(String, String)>,
    ) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        Self {
            http,
            base_url: format!("{}://{}", scheme, reference.registry_endpoint()),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            credentials,
            token: None,
        }
    }

    /// Whether the repository already holds the blob.
    ///
    /// Any answer other than 2xx or 404 is treated as "missing" so the blob
    /// gets uploaded; transport failures are errors.
    pub(crate) async fn exists(&mut self, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, self.repository, digest);

        let response = self.head(&url).await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED && self.token.is_none() {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            match challenge {
                Some(challenge) => {
                    self.authenticate(&challenge).await?;
                    self.head(&url).await?
                }
                None => response,
            }
        } else {
            response
        };

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            tracing::debug!(
                digest = %digest,
                status = %status,
                "Blob lookup inconclusive, treating as missing"
            );
            Ok(false)
        }
    }

    async fn head(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.http.head(url);
        if let Some(ref token) = self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        } else if let Some((ref username, ref password)) = self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        request
            .send()
            .await
            .map_err(|e| StrataError::registry(&self.registry, format!("Failed to look up blob: {}", e)))
    }

    /// Exchange credentials for a bearer token as described by the challenge.
    async fn authenticate(&mut self, challenge: &str) -> Result<()> {
        let params = match parse_bearer_challenge(challenge) {
            Some(params) => params,
            // Basic challenges are already answered by `head`.
            None => return Ok(()),
        };
        let realm = params.get("realm").ok_or_else(|| {
            StrataError::registry(&self.registry, "Bearer challenge without realm")
        })?;

        let scope = format!("repository:{}:pull,push", self.repository);
        let mut query: Vec<(&str, &str)> = vec![("scope", scope.as_str())];
        if let Some(service) = params.get("service") {
            query.push(("service", service.as_str()));
        }

        let mut request = self.http.get(realm.as_str()).query(&query);
        if let Some((ref username, ref password)) = self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            StrataError::registry(&self.registry, format!("Failed to fetch token: {}", e))
        })?;
        if !response.status().is_success() {
            return Err(StrataError::registry(
                &self.registry,
                format!("Token endpoint returned {}", response.status()),
            ));
        }
        let body: TokenResponse = response.json().await.map_err(|e| {
            StrataError::registry(&self.registry, format!("Invalid token response: {}", e))
        })?;

        self.token = body.token.or(body.access_token);
        if self.token.is_none() {
            return Err(StrataError::registry(
                &self.registry,
                "Token response carries no token",
            ));
        }
        tracing::debug!(registry = %self.registry, "Obtained registry token");
        Ok(())
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
///
/// Returns `None` for non-bearer challenges. Quoted values may contain
/// commas.
fn parse_bearer_challenge(challenge: &str) -> Option<HashMap<String, String>> {
    let challenge = challenge.trim();
    let (scheme, rest) = challenge.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hub_challenge() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull");
    }

    #[test]
    fn test_parse_quoted_comma() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token", scope="repository:org/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["scope"], "repository:org/app:pull,push");
        assert!(!params.contains_key("service"));
    }

    #[test]
    fn test_parse_unquoted_values() {
        let params = parse_bearer_challenge("bearer realm=https://r/token,service=reg").unwrap();
        assert_eq!(params["realm"], "https://r/token");
        assert_eq!(params["service"], "reg");
    }

    #[test]
    fn test_parse_basic_challenge() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_bearer_challenge("").is_none());
    }

    #[test]
    fn test_lookup_urls() {
        let reference = ImageReference::parse("localhost:5000/team/app:v1").unwrap();
        let lookup = BlobLookup::new(reqwest::Client::new(), &reference, true, None);
        assert_eq!(lookup.base_url, "http://localhost:5000");
        assert_eq!(lookup.repository, "team/app");

        let hub = ImageReference::parse("alpine").unwrap();
        let lookup = BlobLookup::new(reqwest::Client::new(), &hub, false, None);
        assert_eq!(lookup.base_url, "https://registry-1.docker.io");
        assert_eq!(lookup.repository, "library/alpine");
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_an_error() {
        let reference = ImageReference::parse("127.0.0.1:1/app:v1").unwrap();
        let mut lookup = BlobLookup::new(reqwest::Client::new(), &reference, true, None);
        let err = lookup
            .exists("sha256:0000000000000000000000000000000000000000000000000000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::RegistryError { .. }));
    }
}
