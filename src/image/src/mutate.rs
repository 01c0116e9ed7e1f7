//! Value-level image mutation.
//!
//! Each function takes an image by reference and returns a new image; the
//! input is left untouched.

use oci_spec::image::HistoryBuilder;
use strata_core::error::Result;

use super::image::{oci_spec_error, Image, LayerSource, RuntimeConfig};
use super::layer::Layer;

/// `created_by` recorded in the history entry of each appended layer.
const HISTORY_CREATED_BY: &str = "strata";

/// Replace the runtime config section of an image.
///
/// Layers, rootfs, history, platform fields, and unknown top-level keys
/// carry over unchanged.
pub fn config(base: &Image, config: impl Into<RuntimeConfig>) -> Image {
    let mut image = base.clone();
    let (config_file, _) = image.parts_mut();
    config_file.config = Some(config.into());
    image
}

/// Append layers on top of an image.
///
/// Every layer adds its diff id to `rootfs.diff_ids` and a history entry.
/// The entry does not mention where the layer was read from, so the config
/// digest depends only on layer contents.
pub fn append_layers(base: &Image, layers: impl IntoIterator<Item = Layer>) -> Result<Image> {
    let mut image = base.clone();
    let (config_file, sources) = image.parts_mut();

    let mut diff_ids = config_file.rootfs.diff_ids().clone();
    for layer in layers {
        tracing::debug!(
            digest = %layer.digest(),
            diff_id = %layer.diff_id(),
            "Appending layer"
        );
        diff_ids.push(layer.diff_id().to_string());
        config_file.history.push(
            HistoryBuilder::default()
                .created_by(HISTORY_CREATED_BY)
                .build()
                .map_err(oci_spec_error)?,
        );
        sources.push(LayerSource::Local(layer));
    }
    config_file.rootfs.set_diff_ids(diff_ids);

    Ok(image)
}
