//! Image export command.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use strata_core::builder::{export_image, load_descriptor, ImageDescriptor, SnapshotStore};
use strata_core::{paths, Config};

/// Export a registered image (by id or unique prefix) as a gzipped
/// tarball.
pub fn export(image: &str, output: &str) -> Result<()> {
    let config = Config::load()?;
    let data_dir = config.effective_data_dir();

    let descriptor = load_descriptor(&paths::images_dir_in(&data_dir), image)?;
    write_tarball(&data_dir, &descriptor, Path::new(output))
        .with_context(|| format!("could not export image to {}", output))?;

    println!(
        "{} Exported {} to {}",
        "»".bold().blue(),
        descriptor.short_id().cyan(),
        output.cyan()
    );
    Ok(())
}

pub(crate) fn write_tarball(
    data_dir: &Path,
    descriptor: &ImageDescriptor,
    out: &Path,
) -> Result<()> {
    let store = SnapshotStore::open(&paths::store_dir_in(data_dir))?;
    export_image(&store, descriptor, out)?;
    Ok(())
}
