//! Snapshot store maintenance commands.

use anyhow::{bail, Result};
use colored::Colorize;
use strata_core::builder::{short_fingerprint, SnapshotStore};
use strata_core::{paths, Config};

use crate::commands::format_size;

fn open_store() -> Result<SnapshotStore> {
    let config = Config::load()?;
    Ok(SnapshotStore::open(&paths::store_dir_in(&config.effective_data_dir()))?)
}

pub fn cache_stats() -> Result<()> {
    let store = open_store()?;
    let stats = store.stats()?;

    println!("Snapshots: {}", stats.snapshots);
    println!("Blobs:     {}", stats.blobs);
    println!("Size:      {}", format_size(stats.blob_bytes));
    Ok(())
}

pub fn cache_clear() -> Result<()> {
    let store = open_store()?;
    store.clear()?;
    println!("{}", "Cache cleared".green());
    Ok(())
}

pub fn cache_rm(fingerprint: &str) -> Result<()> {
    let store = open_store()?;
    if !store.remove(fingerprint)? {
        bail!("no snapshot with fingerprint '{}'", fingerprint);
    }
    let dropped = store.gc_blobs()?;
    println!(
        "Removed snapshot {} ({} unreferenced blobs dropped)",
        short_fingerprint(fingerprint).cyan(),
        dropped
    );
    Ok(())
}

pub fn cache_prune(max_size: u64) -> Result<()> {
    let store = open_store()?;
    let report = store.prune(max_size)?;
    let stats = store.stats()?;

    println!(
        "Pruned {} snapshots and {} blobs, store now {}",
        report.snapshots_removed,
        report.blobs_removed,
        format_size(stats.blob_bytes).yellow()
    );
    Ok(())
}
