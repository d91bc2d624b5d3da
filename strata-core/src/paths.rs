//! Centralized path configuration for strata.
//!
//! All data paths should go through this module so the CLI and any
//! embedding process agree on where state lives, whether running as a
//! user or as a system service.

use std::path::{Path, PathBuf};

/// Get the strata data directory.
///
/// Resolution order:
/// 1. `STRATA_DATA_DIR` environment variable
/// 2. `/var/lib/strata` if it exists (system install)
/// 3. `~/.strata` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/strata");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".strata")).unwrap_or(system_dir)
}

/// Get the snapshot store directory (blobs + snapshot manifests).
pub fn store_dir() -> PathBuf {
    data_dir().join("store")
}

/// Get the registered-images directory.
pub fn images_dir() -> PathBuf {
    data_dir().join("images")
}

/// Get the local base-environments directory.
///
/// Each subdirectory is a rootfs importable as `ext:<name>`.
pub fn bases_dir() -> PathBuf {
    data_dir().join("bases")
}

/// Get the transient working-root directory for in-flight stages.
pub fn work_dir() -> PathBuf {
    data_dir().join("work")
}

/// Get the config file path.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Same layout as [`store_dir`] and friends, rooted at an explicit data dir.
///
/// Components take an explicit root so tests and embedders can avoid
/// process-global state.
pub fn store_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("store")
}

pub fn images_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("images")
}

pub fn bases_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("bases")
}

pub fn work_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("work")
}
