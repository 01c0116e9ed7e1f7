//! The image assembly pipeline.
//!
//! ```text
//! base (or empty) ─▶ config overrides ─▶ data layer ─▶ append ─▶ write
//! ```
//!
//! Both references and the data path are checked while planning, so a bad
//! invocation fails before any registry is contacted.

use std::path::PathBuf;
use std::time::Instant;

use strata_core::error::{Result, StrataError};
use strata_image::{
    mutate, Image, ImageReference, Layer, LayerOptions, Remote, RuntimeConfig, WriteResult,
};

use crate::cli::Cli;

/// Config overrides taken from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// `KEY=VALUE` pairs appended after the inherited environment.
    pub env: Vec<(String, String)>,
    /// Replaces the image user when set.
    pub user: Option<String>,
    /// Replaces the entrypoint with a single-element list when set.
    pub entrypoint: Option<String>,
}

impl Overrides {
    /// Apply the overrides to a config section.
    ///
    /// Inherited `Env` entries are kept as they are, even when a key is
    /// overridden. Fields other than Env, User and Entrypoint pass through.
    pub fn apply(&self, mut runtime: RuntimeConfig) -> RuntimeConfig {
        let config = &mut runtime.config;
        if !self.env.is_empty() {
            let mut env = config.env().clone().unwrap_or_default();
            env.extend(self.env.iter().map(|(k, v)| format!("{k}={v}")));
            config.set_env(Some(env));
        }
        if let Some(ref user) = self.user {
            config.set_user(Some(user.clone()));
        }
        if let Some(ref entrypoint) = self.entrypoint {
            config.set_entrypoint(Some(vec![entrypoint.clone()]));
        }
        runtime
    }
}

/// A validated invocation.
#[derive(Debug, Clone)]
pub struct Plan {
    pub base: Option<ImageReference>,
    pub dest: ImageReference,
    pub data: PathBuf,
    pub overrides: Overrides,
    pub layer_options: LayerOptions,
}

impl Plan {
    /// Validate the command line without touching the network.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let base = cli.base.as_deref().map(ImageReference::parse).transpose()?;
        let dest = ImageReference::parse(&cli.dest)?;

        let data = cli.data_path();
        if !data.exists() {
            return Err(StrataError::LayerError(format!(
                "Data path {} does not exist",
                data.display()
            )));
        }

        Ok(Self {
            base,
            dest,
            data,
            overrides: Overrides {
                env: cli.env_vars(),
                user: cli.user.clone().filter(|u| !u.is_empty()),
                entrypoint: cli.entrypoint.clone().filter(|e| !e.is_empty()),
            },
            layer_options: LayerOptions {
                compressed_caching: !cli.no_cache,
            },
        })
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// The image that was written.
    pub image: Image,
    /// Digest of the layer built from the data path.
    pub layer_digest: String,
    /// What the registry write did.
    pub write: WriteResult,
}

/// Run the pipeline against `remote`.
///
/// Each stage logs the time elapsed since the start of the run.
pub async fn run<R: Remote + ?Sized>(plan: &Plan, remote: &R) -> Result<PipelineReport> {
    let start = Instant::now();

    let base = match plan.base {
        Some(ref reference) => remote.fetch(reference).await?,
        None => Image::empty()?,
    };
    tracing::info!("base in {:?}", start.elapsed());

    let configured = mutate::config(&base, plan.overrides.apply(base.config()));
    tracing::info!("config in {:?}", start.elapsed());

    let layer = Layer::from_path(&plan.data, plan.layer_options)?;
    let layer_digest = layer.digest().to_string();
    tracing::info!(digest = %layer_digest, "read layer in {:?}", start.elapsed());

    let image = mutate::append_layers(&configured, [layer])?;
    tracing::info!("layer in {:?}", start.elapsed());

    let write = remote.write(&plan.dest, &image).await?;
    tracing::info!(
        dest = %plan.dest,
        uploaded = write.uploaded,
        mounted = write.mounted,
        skipped = write.skipped,
        "write in {:?}",
        start.elapsed()
    );

    Ok(PipelineReport {
        image,
        layer_digest,
        write,
    })
}
