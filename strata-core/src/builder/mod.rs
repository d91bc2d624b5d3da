//! Stage pipeline engine.
//!
//! This module covers the full life of a build: parsing pipeline
//! definitions, wiring stages into a dependency graph, executing them
//! against the snapshot cache, and assembling the target stage into an
//! image descriptor.

pub mod args;
pub mod assemble;
pub mod base;
pub mod build;
pub mod cache;
pub mod copy;
pub mod exec;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod snapshot;
pub mod store;

pub use args::{resolve_base_ref, resolve_stage, ArgumentScope, ResolvedStage};
pub use assemble::{
    assemble, export_image, list_images, load_descriptor, register_image, ImageDescriptor,
    RuntimeMetadata,
};
pub use base::{base_fingerprint, BaseProvider, LocalBaseProvider};
pub use build::{build_image, BuildOptions, BuildReport, BuildStats, StageReport};
pub use cache::{CacheStatus, SnapshotCache};
pub use exec::{CommandRunner, ExitDetails, ProcessSpec, ShellRunner};
pub use executor::{
    stage_fingerprint, BuildError, BuildResult, StageExecutor, StageOutcome, StageState,
};
pub use graph::{GraphError, StageGraph};
pub use parser::{
    parse_pipeline, parse_pipeline_file, BaseRef, Instruction, ParseError, Pipeline, RunCommand,
    Stage,
};
pub use snapshot::{
    normalize_path, sha256_hex, short_fingerprint, FileEntry, FileKind, Fingerprint, Layer,
    Snapshot, SnapshotManifest,
};
pub use store::{CacheError, PruneReport, SnapshotStore, StoreStats};
