//! Strata Image - OCI image primitives.
//!
//! This crate provides the pieces the `strata` command composes:
//!
//! - Image reference parsing ([`ImageReference`])
//! - Layer creation from a tarball or directory ([`Layer`])
//! - Value-level image mutation ([`mutate`])
//! - Registry fetch and write ([`RegistryClient`], behind the [`Remote`] trait)
//! - Progress events for network transfers ([`progress`])
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   fetch    ┌─────────┐   mutate::config    ┌─────────┐
//! │   registry   │ ─────────▶ │  Image  │ ──────────────────▶ │  Image  │
//! └──────────────┘            └─────────┘                     └────┬────┘
//!        ▲                                                        │ mutate::append_layers
//!        │ write (skips blobs already present)               ┌────▼────┐
//!        └────────────────────────────────────────────────── │  Image  │ ◀── Layer::from_path
//!                                                            └─────────┘
//! ```

#![allow(clippy::result_large_err)]

pub mod credentials;
mod image;
pub mod layer;
mod lookup;
pub mod mutate;
pub mod progress;
pub mod reference;
pub mod registry;

pub use credentials::CredentialStore;
pub use image::{
    ConfigFile, Image, LayerSource, ManifestFormat, RemoteLayer, RuntimeConfig,
    IMAGE_CONFIG_MEDIA_TYPE,
};
pub use layer::{Layer, LayerOptions, LAYER_MEDIA_TYPE};
pub use progress::{ProgressSender, Update};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryClient, RegistryOptions, Remote, WriteResult};

/// Strata Image version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
