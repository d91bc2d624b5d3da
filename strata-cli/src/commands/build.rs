//! Build command implementation.
//!
//! Runs a pipeline build with a progress spinner, then prints one line
//! per stage and a summary block.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use strata_core::builder::{build_image, short_fingerprint, BuildOptions, StageState};
use strata_core::Config;

use crate::commands::export::write_tarball;
use crate::commands::format_size;

pub async fn build(
    path: String,
    args: Vec<String>,
    target: Option<String>,
    no_cache: bool,
    no_entry_check: bool,
    output: Option<String>,
) -> Result<()> {
    let pipeline = resolve_pipeline_path(PathBuf::from(path));
    let args = parse_args(&args)?;
    let config = Config::load()?;
    let data_dir = config.effective_data_dir();

    println!("{} Building {}", "»".bold().blue(), pipeline.display().to_string().cyan());
    if no_cache {
        println!("  {}", "cache disabled".yellow());
    }

    let mut options = BuildOptions::new(&pipeline);
    options.args = args;
    options.target = target;
    options.no_cache = no_cache;
    options.runnable = !no_entry_check;
    options.data_dir = Some(data_dir.clone());
    options.max_concurrent = config.max_concurrent_stages;
    options.keep_work_dirs = config.keep_work_dirs;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message("Running stages");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = build_image(options).await;
    spinner.finish_and_clear();
    let report = result?;

    for stage in &report.stages {
        let marker = match stage.state {
            StageState::CacheHit => "cached".cyan(),
            _ => "built ".green(),
        };
        println!(
            "  {} {} {} ({} ms)",
            marker,
            stage.name,
            short_fingerprint(&stage.fingerprint).dimmed(),
            stage.elapsed_ms
        );
    }

    let stats = &report.stats;
    println!();
    println!("{}", "Build completed successfully!".green().bold());
    println!();
    println!("  Image ID:  {}", report.descriptor.short_id().cyan());
    println!("  Stage:     {}", report.descriptor.stage_name.green());
    println!("  Entries:   {}", report.descriptor.entry_count);
    println!("  Size:      {}", format_size(report.descriptor.size_bytes).yellow());
    println!(
        "  Stages:    {} executed, {} cached, {} skipped",
        stats.stages_executed, stats.stages_cached, stats.stages_skipped
    );
    println!("  Duration:  {}", format_duration(stats.duration_ms).yellow());

    if let Some(out) = output {
        let out = PathBuf::from(out);
        write_tarball(&data_dir, &report.descriptor, &out)
            .with_context(|| format!("could not export image to {}", out.display()))?;
        println!("  Exported:  {}", out.display().to_string().cyan());
    }

    Ok(())
}

/// A directory argument means its Stagefile.
fn resolve_pipeline_path(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        path.join("Stagefile")
    } else {
        path
    }
}

/// Parse repeated `NAME=VALUE` argument flags.
fn parse_args(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut args = HashMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                args.insert(name.to_string(), value.to_string());
            }
            _ => bail!("invalid argument '{}', expected NAME=VALUE", pair),
        }
    }
    Ok(args)
}

fn format_duration(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    } else if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{} ms", ms)
    }
}
