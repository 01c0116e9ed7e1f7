//! In-memory image representation.
//!
//! An [`Image`] is a configuration document plus an ordered list of layers.
//! Layers of a fetched base image stay in the registry until a write needs
//! them; layers built locally carry their own bytes.
//!
//! The configuration is decoded into [`ConfigFile`] rather than
//! `oci_spec::image::ImageConfiguration`: fields the OCI structs do not model
//! (Docker's `Healthcheck`, `Shell`, `container_config`, ...) are kept in
//! `extensions` maps and written back unchanged.

use oci_distribution::manifest::OciDescriptor;
use oci_spec::image::{Config, History, RootFs, RootFsBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::error::{Result, StrataError};

use super::layer::Layer;
use super::reference::ImageReference;

/// Media type of the OCI image configuration blob.
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Media type family of the manifest an image is written with.
///
/// Images fetched from a registry keep the family of their manifest; the
/// empty image is OCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestFormat {
    #[default]
    Oci,
    Docker,
}

impl ManifestFormat {
    /// Family of a manifest with the given `mediaType`.
    ///
    /// Manifests without a media type are treated as OCI.
    pub fn from_media_type(media_type: Option<&str>) -> Self {
        match media_type {
            Some(DOCKER_MANIFEST_MEDIA_TYPE) => ManifestFormat::Docker,
            _ => ManifestFormat::Oci,
        }
    }

    pub fn manifest_media_type(self) -> &'static str {
        match self {
            ManifestFormat::Oci => OCI_MANIFEST_MEDIA_TYPE,
            ManifestFormat::Docker => DOCKER_MANIFEST_MEDIA_TYPE,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            ManifestFormat::Oci => IMAGE_CONFIG_MEDIA_TYPE,
            ManifestFormat::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        }
    }

    /// Media type given to gzip layers built locally.
    pub fn layer_media_type(self) -> &'static str {
        match self {
            ManifestFormat::Oci => OCI_LAYER_MEDIA_TYPE,
            ManifestFormat::Docker => DOCKER_LAYER_MEDIA_TYPE,
        }
    }
}

/// The runtime `config` section of an image configuration.
///
/// `config` holds the fields modelled by `oci-spec` (Env, User, Entrypoint,
/// Cmd, ...); every other key of the section lands in `extensions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(flatten)]
    pub config: Config,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl From<Config> for RuntimeConfig {
    fn from(config: Config) -> Self {
        Self {
            config,
            extensions: Map::new(),
        }
    }
}

/// An image configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// Top-level keys not modelled above (`created`, `variant`, ...).
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl ConfigFile {
    /// Decode a configuration blob.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| StrataError::OciImageError(format!("Invalid image config: {}", e)))
    }
}

/// A layer that lives in a registry repository.
#[derive(Debug, Clone)]
pub struct RemoteLayer {
    /// Repository the blob can be pulled from.
    pub source: ImageReference,
    /// Manifest descriptor of the compressed blob.
    pub descriptor: OciDescriptor,
    /// Diff id recorded for this layer in the source config.
    pub diff_id: String,
}

/// One layer of an image, either still remote or built locally.
#[derive(Debug, Clone)]
pub enum LayerSource {
    Remote(RemoteLayer),
    Local(Layer),
}

impl LayerSource {
    /// Manifest descriptor of the layer blob.
    ///
    /// Local layers take the layer media type of `format`; remote layers
    /// keep the descriptor of their source manifest.
    pub fn descriptor(&self, format: ManifestFormat) -> OciDescriptor {
        match self {
            LayerSource::Remote(remote) => remote.descriptor.clone(),
            LayerSource::Local(layer) => OciDescriptor {
                media_type: format.layer_media_type().to_string(),
                ..layer.descriptor()
            },
        }
    }

    /// Blob digest of the compressed layer.
    pub fn digest(&self) -> &str {
        match self {
            LayerSource::Remote(remote) => &remote.descriptor.digest,
            LayerSource::Local(layer) => layer.digest(),
        }
    }

    /// Diff id of the uncompressed layer.
    pub fn diff_id(&self) -> &str {
        match self {
            LayerSource::Remote(remote) => &remote.diff_id,
            LayerSource::Local(layer) => layer.diff_id(),
        }
    }

    /// Compressed size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            LayerSource::Remote(remote) => u64::try_from(remote.descriptor.size).unwrap_or_default(),
            LayerSource::Local(layer) => layer.size(),
        }
    }
}

/// An OCI image value.
///
/// Images are never modified in place: the functions in
/// [`mutate`](crate::mutate) return new values.
#[derive(Debug, Clone)]
pub struct Image {
    config_file: ConfigFile,
    layers: Vec<LayerSource>,
    format: ManifestFormat,
}

impl Image {
    /// Create an image from its configuration and layers.
    ///
    /// `rootfs.diff_ids` of the configuration must list one entry per layer.
    pub fn new(config_file: ConfigFile, layers: Vec<LayerSource>) -> Result<Self> {
        let diff_ids = config_file.rootfs.diff_ids();
        if diff_ids.len() != layers.len() {
            return Err(StrataError::OciImageError(format!(
                "Image config lists {} diff ids for {} layers",
                diff_ids.len(),
                layers.len()
            )));
        }
        Ok(Self {
            config_file,
            layers,
            format: ManifestFormat::default(),
        })
    }

    /// The empty (scratch) image: no layers, an empty config, and the
    /// host's architecture on linux.
    pub fn empty() -> Result<Self> {
        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(Vec::<String>::new())
            .build()
            .map_err(oci_spec_error)?;

        let config_file = ConfigFile {
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config: Some(RuntimeConfig::default()),
            rootfs,
            history: Vec::new(),
            extensions: Map::new(),
        };

        Self::new(config_file, Vec::new())
    }

    /// Use `format` for the manifest this image is written with.
    pub fn with_format(mut self, format: ManifestFormat) -> Self {
        self.format = format;
        self
    }

    /// The full image configuration document.
    pub fn config_file(&self) -> &ConfigFile {
        &self.config_file
    }

    /// The runtime config section (Env, User, Entrypoint, ...).
    ///
    /// An image without a config section yields an empty one.
    pub fn config(&self) -> RuntimeConfig {
        self.config_file.config.clone().unwrap_or_default()
    }

    /// Layers in order, bottom to top.
    pub fn layers(&self) -> &[LayerSource] {
        &self.layers
    }

    /// Manifest family this image is written with.
    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    /// Environment entries (`KEY=VALUE`) of the config section.
    pub fn env(&self) -> Vec<String> {
        self.config().config.env().clone().unwrap_or_default()
    }

    /// Serialized configuration blob.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config_file)?)
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut ConfigFile, &mut Vec<LayerSource>) {
        (&mut self.config_file, &mut self.layers)
    }
}

/// OCI architecture name of the host.
pub(crate) fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

pub(crate) fn oci_spec_error(err: impl std::fmt::Display) -> StrataError {
    StrataError::OciImageError(err.to_string())
}
