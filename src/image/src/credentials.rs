//! Registry credentials from the Docker client configuration.
//!
//! Reads `auths` entries from `$DOCKER_CONFIG/config.json`, or
//! `~/.docker/config.json` when `DOCKER_CONFIG` is unset. The file is never
//! written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use strata_core::error::{Result, StrataError};

/// One `auths` entry of the Docker config file.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The part of the Docker config file we care about.
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Read-only view of the Docker client credential file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at the Docker client's default location.
    pub fn default_path() -> Result<Self> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG").filter(|d| !d.is_empty()) {
            return Ok(Self::new(PathBuf::from(dir).join("config.json")));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            StrataError::ConfigError(
                "Cannot determine home directory for Docker config".to_string(),
            )
        })?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    /// Credential store backed by a specific config file.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the backing config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    ///
    /// A missing file yields `None`; an unreadable or malformed one is an
    /// error.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);

        let entry = file
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry);

        match entry {
            Some(entry) => self.decode(registry, entry),
            None => Ok(None),
        }
    }

    fn decode(&self, registry: &str, entry: &AuthEntry) -> Result<Option<(String, String)>> {
        if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD.decode(auth.trim()).map_err(|e| {
                StrataError::ConfigError(format!(
                    "Invalid auth entry for {} in {}: {}",
                    registry,
                    self.path.display(),
                    e
                ))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|e| {
                StrataError::ConfigError(format!(
                    "Invalid auth entry for {} in {}: {}",
                    registry,
                    self.path.display(),
                    e
                ))
            })?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                StrataError::ConfigError(format!(
                    "Invalid auth entry for {} in {}: expected user:password",
                    registry,
                    self.path.display()
                ))
            })?;
            return Ok(Some((username.to_string(), password.to_string())));
        }

        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Ok(Some((username.clone(), password.clone()))),
            _ => Ok(None),
        }
    }

    /// Load the config file from disk. Returns empty if not found.
    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to read Docker config {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to parse Docker config {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Normalize registry keys so that `https://index.docker.io/v1/`,
/// `docker.io` and `registry-1.docker.io` all compare equal.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> CredentialStore {
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        CredentialStore::new(path)
    }

    fn encoded(user_pass: &str) -> String {
        STANDARD.encode(user_pass)
    }

    #[test]
    fn test_get_from_auth_field() {
        let dir = TempDir::new().unwrap();
        let store = write_config(
            &dir,
            &format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{}"}}}}}}"#, encoded("user1:pass1")),
        );

        let creds = store.get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user1".to_string(), "pass1".to_string())));
    }

    #[test]
    fn test_password_may_contain_colon() {
        let dir = TempDir::new().unwrap();
        let store = write_config(
            &dir,
            &format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, encoded("robot:a:b")),
        );

        let creds = store.get("quay.io").unwrap();
        assert_eq!(creds, Some(("robot".to_string(), "a:b".to_string())));
    }

    #[test]
    fn test_get_from_username_password() {
        let dir = TempDir::new().unwrap();
        let store = write_config(
            &dir,
            r#"{"auths":{"localhost:5000":{"username":"u","password":"p"}}}"#,
        );

        let creds = store.get("localhost:5000").unwrap();
        assert_eq!(creds, Some(("u".to_string(), "p".to_string())));
    }

    #[test]
    fn test_get_nonexistent_registry() {
        let dir = TempDir::new().unwrap();
        let store = write_config(&dir, r#"{"auths":{}}"#);
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_file_without_auths() {
        let dir = TempDir::new().unwrap();
        let store = write_config(&dir, r#"{"credsStore":"desktop"}"#);
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_entry_without_credentials() {
        let dir = TempDir::new().unwrap();
        let store = write_config(&dir, r#"{"auths":{"ghcr.io":{}}}"#);
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let store = write_config(&dir, "not json");
        let err = store.get("ghcr.io").unwrap_err();
        assert!(matches!(err, StrataError::ConfigError(_)));
    }

    #[test]
    fn test_malformed_auth() {
        let dir = TempDir::new().unwrap();
        let store = write_config(
            &dir,
            &format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{}"}}}}}}"#, encoded("nocolon")),
        );
        assert!(store.get("ghcr.io").is_err());
    }

    #[test]
    fn test_docker_io_normalization() {
        let dir = TempDir::new().unwrap();
        let store = write_config(
            &dir,
            &format!(
                r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#,
                encoded("user:pass")
            ),
        );

        let expected = Some(("user".to_string(), "pass".to_string()));
        assert_eq!(store.get("docker.io").unwrap(), expected);
        assert_eq!(store.get("registry-1.docker.io").unwrap(), expected);
        assert_eq!(store.get("index.docker.io").unwrap(), expected);
    }

    #[test]
    fn test_normalize_registry() {
        assert_eq!(normalize_registry("GHCR.io"), "ghcr.io");
        assert_eq!(normalize_registry("https://ghcr.io/v2/"), "ghcr.io");
        assert_eq!(normalize_registry("http://localhost:5000"), "localhost:5000");
        assert_eq!(normalize_registry("docker.io"), "index.docker.io");
    }
}
