//! Strata CLI - assemble a container image and push it to a registry.

pub mod cli;
pub mod pipeline;

use strata_image::progress;
use strata_image::{RegistryClient, RegistryOptions};

pub use cli::Cli;
pub use pipeline::{Overrides, PipelineReport, Plan};

/// Run the command described by `cli`.
pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let plan = Plan::from_cli(&cli)?;

    let (updates, receiver) = progress::channel();
    progress::spawn_logger(receiver);

    let remote = RegistryClient::new(RegistryOptions {
        auth: None,
        insecure: cli.insecure,
    })
    .with_progress(updates);

    let report = pipeline::run(&plan, &remote).await?;

    tracing::info!(
        dest = %plan.dest,
        layer = %report.layer_digest,
        manifest_url = %report.write.manifest_url,
        "Image pushed"
    );

    Ok(())
}
