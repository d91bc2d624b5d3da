//! Image listing command.

use anyhow::Result;
use colored::Colorize;
use strata_core::builder::list_images;
use strata_core::{paths, Config};

use crate::commands::format_size;

/// Print every registered image, newest first.
pub fn images() -> Result<()> {
    let config = Config::load()?;
    let images = list_images(&paths::images_dir_in(&config.effective_data_dir()))?;

    if images.is_empty() {
        println!("No images registered.");
        println!();
        println!("Build one with: {}", "strata build".cyan());
        return Ok(());
    }

    println!("{:<14} {:<20} {:>8} {:>9}  {}", "IMAGE ID", "STAGE", "ENTRIES", "SIZE", "CREATED");
    for image in images {
        println!(
            "{:<14} {:<20} {:>8} {:>9}  {}",
            image.short_id(),
            image.stage_name,
            image.entry_count,
            format_size(image.size_bytes),
            image.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(())
}
