//! OCI registry client for fetching and writing images.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, local registries, etc.).

use std::collections::HashSet;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use strata_core::error::{Result, StrataError};

use super::credentials::CredentialStore;
use super::image::{
    host_architecture, ConfigFile, Image, LayerSource, ManifestFormat, RemoteLayer,
};
use super::layer::sha256_bytes;
use super::lookup::BlobLookup;
use super::progress::{Progress, ProgressSender};
use super::reference::ImageReference;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        Self::from_pair(
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        )
    }

    /// Resolve credentials for a registry: environment variables first, then
    /// the Docker config file, then anonymous.
    pub fn from_credential_store(registry: &str) -> Self {
        let env = Self::from_env();
        let store = CredentialStore::default_path().ok();
        Self::resolve(registry, env, store.as_ref())
    }

    fn resolve(registry: &str, env: RegistryAuth, store: Option<&CredentialStore>) -> Self {
        if !env.is_anonymous() {
            return env;
        }
        if let Some(store) = store {
            match store.get(registry) {
                Ok(Some((username, password))) => return Self::basic(username, password),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    registry = %registry,
                    error = %e,
                    "Ignoring unreadable Docker config"
                ),
            }
        }
        Self::anonymous()
    }

    fn from_pair(username: Option<String>, password: Option<String>) -> Self {
        match (username, password) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Whether no credentials are set.
    pub fn is_anonymous(&self) -> bool {
        self.credentials().is_none()
    }

    /// `(username, password)` when both are set.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match self.credentials() {
            Some((u, p)) => OciRegistryAuth::Basic(u, p),
            None => OciRegistryAuth::Anonymous,
        }
    }
}

/// Result of a successful image write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// URL of the pushed manifest.
    pub manifest_url: String,
    /// URL of the pushed config blob.
    pub config_url: String,
    /// Layer blobs uploaded by this write.
    pub uploaded: usize,
    /// Base layer blobs mounted from another repository of the same registry.
    pub mounted: usize,
    /// Layer blobs the destination already held.
    pub skipped: usize,
}

/// Reads images from and writes images to registries.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetch the manifest and configuration of an image.
    ///
    /// Layer contents stay remote until a write needs them.
    async fn fetch(&self, reference: &ImageReference) -> Result<Image>;

    /// Write an image to `reference`, skipping layer blobs the destination
    /// repository already holds.
    async fn write(&self, reference: &ImageReference, image: &Image) -> Result<WriteResult>;
}

/// Options for constructing a [`RegistryClient`].
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Credentials for every registry. `None` resolves them per registry.
    pub auth: Option<RegistryAuth>,
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
}

/// [`Remote`] backed by real registries.
pub struct RegistryClient {
    client: Client,
    http: reqwest::Client,
    options: RegistryOptions,
    progress: Option<ProgressSender>,
}

impl RegistryClient {
    /// Create a registry client.
    pub fn new(options: RegistryOptions) -> Self {
        let protocol = if options.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            http: reqwest::Client::new(),
            options,
            progress: None,
        }
    }

    /// Report transfer progress on `sender`.
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self.options.auth {
            Some(ref auth) => auth.clone(),
            None => RegistryAuth::from_credential_store(registry),
        }
    }

    /// Pull one blob of a remote base layer from its source repository.
    async fn pull_remote_layer(&self, layer: &RemoteLayer) -> Result<Vec<u8>> {
        let source = &layer.source;
        let oci_ref = source.to_oci_reference()?;
        let auth = self.auth_for(&source.registry).to_oci_auth();

        tracing::debug!(
            source = %source,
            digest = %layer.descriptor.digest,
            "Pulling base layer"
        );

        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| {
                StrataError::registry(&source.registry, format!("Failed to authenticate: {}", e))
            })?;

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &layer.descriptor, &mut data)
            .await
            .map_err(|e| {
                StrataError::registry(
                    &source.registry,
                    format!("Failed to pull layer {}: {}", layer.descriptor.digest, e),
                )
            })?;

        if layer.descriptor.digest.starts_with("sha256:") {
            let actual = format!("sha256:{}", sha256_bytes(&data));
            if actual != layer.descriptor.digest {
                return Err(StrataError::registry(
                    &source.registry,
                    format!(
                        "Layer digest mismatch: expected {}, got {}",
                        layer.descriptor.digest, actual
                    ),
                ));
            }
        }
        Ok(data)
    }

    /// Mount a base layer from its source repository when it lives on the
    /// destination registry. Returns false when the layer still has to be
    /// uploaded.
    async fn mount_remote_layer(
        &self,
        dest_ref: &Reference,
        dest: &ImageReference,
        layer: &RemoteLayer,
    ) -> bool {
        if layer.source.registry_endpoint() != dest.registry_endpoint() {
            return false;
        }
        let source_ref = match layer.source.to_oci_reference() {
            Ok(source_ref) => source_ref,
            Err(_) => return false,
        };

        match self
            .client
            .mount_blob(dest_ref, &source_ref, &layer.descriptor.digest)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    digest = %layer.descriptor.digest,
                    from = %layer.source.repository,
                    "Mounted layer"
                );
                true
            }
            Err(e) => {
                tracing::debug!(
                    digest = %layer.descriptor.digest,
                    error = %e,
                    "Mount refused, uploading layer"
                );
                false
            }
        }
    }
}

/// Manifest listing the config blob and every layer of `image` in order.
///
/// Media types follow the image's manifest family; base layer descriptors
/// are copied from their source manifest as they are.
fn build_manifest(image: &Image, config_data: &[u8]) -> OciImageManifest {
    let format = image.format();
    OciImageManifest {
        schema_version: 2,
        media_type: Some(format.manifest_media_type().to_string()),
        config: OciDescriptor {
            media_type: format.config_media_type().to_string(),
            digest: format!("sha256:{}", sha256_bytes(config_data)),
            size: config_data.len() as i64,
            ..Default::default()
        },
        layers: image
            .layers()
            .iter()
            .map(|layer| layer.descriptor(format))
            .collect(),
        ..Default::default()
    }
}

fn push_error(
    registry: &str,
    progress: &Progress,
    what: &str,
    err: impl std::fmt::Display,
) -> StrataError {
    progress.fail(&err);
    StrataError::registry(registry, format!("Failed to push {}: {}", what, err))
}

#[async_trait]
impl Remote for RegistryClient {
    async fn fetch(&self, reference: &ImageReference) -> Result<Image> {
        let oci_ref = reference.to_oci_reference()?;
        let auth = self.auth_for(&reference.registry).to_oci_auth();

        tracing::info!(reference = %reference, "Fetching image from registry");

        // Resolves multi-arch image indexes to linux on the host architecture
        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| {
                StrataError::registry(&reference.registry, format!("Failed to pull manifest: {}", e))
            })?;

        let mut progress = Progress::new(
            self.progress.clone(),
            u64::try_from(manifest.config.size).unwrap_or_default(),
        );
        let mut config_data: Vec<u8> = Vec::new();
        if let Err(e) = self
            .client
            .pull_blob(&oci_ref, &manifest.config, &mut config_data)
            .await
        {
            progress.fail(&e);
            return Err(StrataError::registry(
                &reference.registry,
                format!("Failed to pull config blob: {}", e),
            ));
        }
        progress.advance(config_data.len() as u64);

        let config_file = ConfigFile::from_slice(&config_data)?;
        let diff_ids = config_file.rootfs.diff_ids().clone();
        if diff_ids.len() != manifest.layers.len() {
            return Err(StrataError::OciImageError(format!(
                "{} lists {} layers but its config has {} diff ids",
                reference,
                manifest.layers.len(),
                diff_ids.len()
            )));
        }

        let format = ManifestFormat::from_media_type(manifest.media_type.as_deref());
        let layers = manifest
            .layers
            .into_iter()
            .zip(diff_ids)
            .map(|(descriptor, diff_id)| {
                LayerSource::Remote(RemoteLayer {
                    source: reference.clone(),
                    descriptor,
                    diff_id,
                })
            })
            .collect();

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            format = ?format,
            "Image fetched"
        );

        Ok(Image::new(config_file, layers)?.with_format(format))
    }

    async fn write(&self, reference: &ImageReference, image: &Image) -> Result<WriteResult> {
        let oci_ref = reference.to_oci_reference()?;
        let auth = self.auth_for(&reference.registry);
        let registry = reference.registry.as_str();

        tracing::info!(
            reference = %reference,
            layers = image.layers().len(),
            "Writing image to registry"
        );

        self.client
            .auth(&oci_ref, &auth.to_oci_auth(), RegistryOperation::Push)
            .await
            .map_err(|e| StrataError::registry(registry, format!("Failed to authenticate: {}", e)))?;

        let config_data = image.config_bytes()?;
        let manifest = build_manifest(image, &config_data);

        let mut lookup = BlobLookup::new(
            self.http.clone(),
            reference,
            self.options.insecure,
            auth.credentials(),
        );

        let mut seen = HashSet::new();
        let unique: Vec<&LayerSource> = image
            .layers()
            .iter()
            .filter(|layer| seen.insert(layer.digest().to_string()))
            .collect();
        let total = unique.iter().map(|layer| layer.size()).sum::<u64>() + config_data.len() as u64;
        let mut progress = Progress::new(self.progress.clone(), total);

        let (mut uploaded, mut mounted, mut skipped) = (0, 0, 0);
        for layer in unique {
            let digest = layer.digest();
            if lookup.exists(digest).await? {
                tracing::debug!(digest = %digest, "Layer already present, skipping upload");
                skipped += 1;
                progress.advance(layer.size());
                continue;
            }

            if let LayerSource::Remote(remote) = layer {
                if self.mount_remote_layer(&oci_ref, reference, remote).await {
                    mounted += 1;
                    progress.advance(layer.size());
                    continue;
                }
            }

            // One layer in memory at a time
            let data = match layer {
                LayerSource::Local(local) => local.compressed()?,
                LayerSource::Remote(remote) => self.pull_remote_layer(remote).await?,
            };
            tracing::debug!(digest = %digest, size = data.len(), "Uploading layer");
            self.client
                .push_blob(&oci_ref, &data, digest)
                .await
                .map_err(|e| push_error(registry, &progress, &format!("layer {}", digest), e))?;
            uploaded += 1;
            progress.advance(data.len() as u64);
        }

        let config_url = self
            .client
            .push_blob(&oci_ref, &config_data, &manifest.config.digest)
            .await
            .map_err(|e| push_error(registry, &progress, "config blob", e))?;
        progress.advance(config_data.len() as u64);

        let manifest_url = self
            .client
            .push_manifest(&oci_ref, &OciManifest::Image(manifest))
            .await
            .map_err(|e| push_error(registry, &progress, "manifest", e))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %manifest_url,
            uploaded,
            mounted,
            skipped,
            "Image written"
        );

        Ok(WriteResult {
            manifest_url,
            config_url,
            uploaded,
            mounted,
            skipped,
        })
    }
}

/// Platform resolver that selects linux images matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::IMAGE_CONFIG_MEDIA_TYPE;
    use oci_distribution::manifest::Platform;
    use tempfile::TempDir;

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.is_anonymous());
        assert!(auth.credentials().is_none());
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(!auth.is_anonymous());
        assert_eq!(
            auth.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn test_registry_auth_half_pair_is_anonymous() {
        let auth = RegistryAuth::from_pair(Some("user".to_string()), None);
        assert!(auth.is_anonymous());
    }

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    fn docker_config(dir: &TempDir) -> CredentialStore {
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"ghcr.io":{"username":"file-user","password":"file-pass"}}}"#,
        )
        .unwrap();
        CredentialStore::new(path)
    }

    #[test]
    fn test_resolve_prefers_env() {
        let dir = TempDir::new().unwrap();
        let store = docker_config(&dir);
        let auth = RegistryAuth::resolve(
            "ghcr.io",
            RegistryAuth::basic("env-user", "env-pass"),
            Some(&store),
        );
        assert_eq!(auth, RegistryAuth::basic("env-user", "env-pass"));
    }

    #[test]
    fn test_resolve_falls_back_to_docker_config() {
        let dir = TempDir::new().unwrap();
        let store = docker_config(&dir);
        let auth = RegistryAuth::resolve("ghcr.io", RegistryAuth::anonymous(), Some(&store));
        assert_eq!(auth, RegistryAuth::basic("file-user", "file-pass"));

        let other = RegistryAuth::resolve("quay.io", RegistryAuth::anonymous(), Some(&store));
        assert!(other.is_anonymous());
    }

    #[test]
    fn test_resolve_ignores_broken_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        let store = CredentialStore::new(path);
        let auth = RegistryAuth::resolve("ghcr.io", RegistryAuth::anonymous(), Some(&store));
        assert!(auth.is_anonymous());
    }

    #[test]
    fn test_client_uses_explicit_auth() {
        let client = RegistryClient::new(RegistryOptions {
            auth: Some(RegistryAuth::basic("u", "p")),
            insecure: false,
        });
        assert_eq!(client.auth_for("any.registry"), RegistryAuth::basic("u", "p"));
    }

    fn index_entry(os: &str, arch: &str, digest: &str) -> ImageIndexEntry {
        ImageIndexEntry {
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            digest: digest.to_string(),
            size: 0,
            platform: Some(Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                os_version: None,
                os_features: None,
                variant: None,
                features: None,
            }),
            annotations: None,
        }
    }

    #[test]
    fn test_platform_resolver_selects_host_linux() {
        let arch = host_architecture();
        let manifests = vec![
            index_entry("windows", arch, "sha256:windows"),
            index_entry("linux", "not-an-arch", "sha256:other"),
            index_entry("linux", arch, "sha256:match"),
        ];
        assert_eq!(
            linux_platform_resolver(&manifests),
            Some("sha256:match".to_string())
        );
    }

    #[test]
    fn test_platform_resolver_no_match() {
        let manifests = vec![index_entry("linux", "not-an-arch", "sha256:other")];
        assert_eq!(linux_platform_resolver(&manifests), None);
        assert_eq!(linux_platform_resolver(&[]), None);
    }

    fn base_layer(digest: &str, media_type: &str) -> LayerSource {
        LayerSource::Remote(RemoteLayer {
            source: ImageReference::parse("registry.local/base:v1").unwrap(),
            descriptor: OciDescriptor {
                media_type: media_type.to_string(),
                digest: digest.to_string(),
                size: 42,
                ..Default::default()
            },
            diff_id: format!("{}-diff", digest),
        })
    }

    fn image_with_layers(layers: Vec<LayerSource>) -> Image {
        let mut config_file = Image::empty().unwrap().config_file().clone();
        config_file
            .rootfs
            .set_diff_ids(layers.iter().map(|l| l.diff_id().to_string()).collect());
        Image::new(config_file, layers).unwrap()
    }

    fn local_layer(dir: &TempDir) -> LayerSource {
        let src = dir.path().join("data");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("file.txt"), "payload").unwrap();
        LayerSource::Local(
            crate::layer::Layer::from_path(&src, crate::layer::LayerOptions::cached()).unwrap(),
        )
    }

    #[test]
    fn test_manifest_of_empty_image_is_oci() {
        let image = image_with_layers(Vec::new());
        let config = image.config_bytes().unwrap();
        let manifest = build_manifest(&image, &config);

        assert_eq!(manifest.schema_version, 2);
        assert_eq!(
            manifest.media_type.as_deref(),
            Some("application/vnd.oci.image.manifest.v1+json")
        );
        assert_eq!(manifest.config.media_type, IMAGE_CONFIG_MEDIA_TYPE);
        assert_eq!(
            manifest.config.digest,
            format!("sha256:{}", sha256_bytes(&config))
        );
        assert_eq!(manifest.config.size, config.len() as i64);
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn test_manifest_follows_docker_base() {
        let docker_layer = "application/vnd.docker.image.rootfs.diff.tar.gzip";
        let tmp = TempDir::new().unwrap();
        let image = image_with_layers(vec![
            base_layer("sha256:aaa", docker_layer),
            local_layer(&tmp),
        ])
        .with_format(ManifestFormat::Docker);
        let manifest = build_manifest(&image, b"{}");

        assert_eq!(
            manifest.media_type.as_deref(),
            Some("application/vnd.docker.distribution.manifest.v2+json")
        );
        assert_eq!(
            manifest.config.media_type,
            "application/vnd.docker.container.image.v1+json"
        );
        // every layer of a Docker manifest carries a Docker media type
        assert!(manifest.layers.iter().all(|l| l.media_type == docker_layer));
        assert_eq!(manifest.layers[0].digest, "sha256:aaa");
        assert_eq!(manifest.layers[1].digest, image.layers()[1].digest());
    }

    #[test]
    fn test_manifest_follows_oci_base() {
        let oci_layer = "application/vnd.oci.image.layer.v1.tar+gzip";
        let tmp = TempDir::new().unwrap();
        let image = image_with_layers(vec![base_layer("sha256:bbb", oci_layer), local_layer(&tmp)]);
        let manifest = build_manifest(&image, b"{}");

        assert_eq!(
            manifest.media_type.as_deref(),
            Some("application/vnd.oci.image.manifest.v1+json")
        );
        assert!(manifest.layers.iter().all(|l| l.media_type == oci_layer));
        assert_eq!(manifest.layers[0].size, 42);
    }

    #[tokio::test]
    async fn test_fetch_unreachable_registry() {
        let client = RegistryClient::new(RegistryOptions {
            auth: Some(RegistryAuth::anonymous()),
            insecure: true,
        });
        let reference = ImageReference::parse("127.0.0.1:1/app:v1").unwrap();
        let err = client.fetch(&reference).await.unwrap_err();
        assert!(matches!(err, StrataError::RegistryError { .. }));
    }
}
