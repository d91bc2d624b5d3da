//! CLI command implementations

pub mod build;
pub mod cache;
pub mod export;
pub mod images;

pub use build::build;
pub use cache::{cache_clear, cache_prune, cache_rm, cache_stats};
pub use export::export;
pub use images::images;

/// Human-readable byte count.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
