//! Strata Core Library
//!
//! Stage pipeline parsing, dependency graphs, cached execution, and
//! image assembly for the strata build engine.

pub mod builder;
pub mod config;
pub mod error;
pub mod paths;

// Re-export commonly used items
pub use builder::{
    build_image, BuildOptions, BuildReport, BuildStats, ImageDescriptor, Pipeline, SnapshotStore,
};
pub use config::Config;
pub use error::{ErrorKind, Result, StrataError};
