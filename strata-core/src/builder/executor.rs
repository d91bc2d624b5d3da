//! Stage execution.
//!
//! A stage runs as: materialize the base snapshot into a work directory,
//! apply instructions in order (commands through the [`CommandRunner`],
//! copies out of dependency snapshots), then freeze the directory back
//! into a delta layer on top of the base. Execution is keyed by the stage
//! fingerprint and routed through [`SnapshotCache`], so identical stages
//! run at most once.

use crate::builder::args::ResolvedStage;
use crate::builder::assemble::RuntimeMetadata;
use crate::builder::cache::{CacheStatus, SnapshotCache};
use crate::builder::copy::{resolve_copy, scan_dir, write_view};
use crate::builder::exec::{CommandRunner, ExitDetails, ProcessSpec};
use crate::builder::parser::{Instruction, Stage};
use crate::builder::snapshot::{
    sha256_hex, short_fingerprint, FileEntry, Fingerprint, Layer, Snapshot,
};
use crate::builder::store::{CacheError, SnapshotStore};
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// Errors raised while resolving or executing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown base environment '{base}'")]
    UnknownBaseEnvironment { base: String },

    #[error("stage '{stage}' references undefined argument '{name}'")]
    UnresolvedArgument { stage: String, name: String },

    #[error("argument '{name}' in stage '{stage}' has no value and no default")]
    MissingArgumentValue { stage: String, name: String },

    #[error("target stage '{target}' is not defined")]
    UnknownTargetStage { target: String },

    #[error("stage '{stage}' step {index} failed ({exit}): {instruction}")]
    InstructionFailed {
        stage: String,
        index: usize,
        instruction: String,
        exit: ExitDetails,
    },

    #[error("could not start command in stage '{stage}': {command}")]
    ProcessSpawn {
        stage: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path '{path}' not found in stage '{source_stage}'")]
    SourcePathNotFound { source_stage: String, path: String },

    #[error("stage '{stage}' has no materialized snapshot")]
    StageNotMaterialized { stage: String },

    #[error("stage '{stage}' is built as runnable but sets no entrypoint or cmd")]
    MissingEntryCommand { stage: String },

    #[error("stage '{stage}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { stage: String, dependency: String },

    #[error("stage '{stage}' canceled")]
    Canceled { stage: String },

    #[error("shared execution of {fingerprint} failed: {message}")]
    Coalesced { fingerprint: Fingerprint, message: String },

    #[error(transparent)]
    Store(#[from] CacheError),

    #[error("i/o error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Internal { message: String },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io { path: path.into(), source }
    }

    /// Coarse classification, used for exit codes and degradation policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::UnknownBaseEnvironment { .. }
            | BuildError::UnresolvedArgument { .. }
            | BuildError::MissingArgumentValue { .. }
            | BuildError::UnknownTargetStage { .. }
            | BuildError::SourcePathNotFound { .. }
            | BuildError::StageNotMaterialized { .. } => ErrorKind::Resolution,
            BuildError::InstructionFailed { .. }
            | BuildError::ProcessSpawn { .. }
            | BuildError::MissingEntryCommand { .. }
            | BuildError::DependencyFailed { .. }
            | BuildError::Canceled { .. }
            | BuildError::Coalesced { .. } => ErrorKind::Execution,
            BuildError::Store(_) => ErrorKind::Cache,
            BuildError::Io { .. } | BuildError::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Lifecycle of a stage within one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Parsed, not yet checked against the graph.
    Defined,
    /// Graph checks passed; schedulable.
    GraphValidated,
    /// Satisfied by an existing snapshot.
    CacheHit,
    /// Instructions are running.
    Executing,
    /// Ran to completion and froze a snapshot.
    Executed,
    /// An instruction failed, or a dependency did.
    Failed,
}

impl StageState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Defined => "defined",
            StageState::GraphValidated => "graph_validated",
            StageState::CacheHit => "cache_hit",
            StageState::Executing => "executing",
            StageState::Executed => "executed",
            StageState::Failed => "failed",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "defined" => Some(StageState::Defined),
            "graph_validated" => Some(StageState::GraphValidated),
            "cache_hit" => Some(StageState::CacheHit),
            "executing" => Some(StageState::Executing),
            "executed" => Some(StageState::Executed),
            "failed" => Some(StageState::Failed),
            _ => None,
        }
    }

    /// No further transitions leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::CacheHit | StageState::Executed | StageState::Failed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What satisfying one stage produced.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage_name: String,
    pub fingerprint: Fingerprint,
    pub snapshot: Arc<Snapshot>,
    pub state: StageState,
    pub elapsed: Duration,
}

/// Content fingerprint of a stage.
///
/// Hashes the base snapshot fingerprint, the resolved instructions with
/// cross-stage references rewritten to the source snapshot fingerprints,
/// and the resolved argument values in declaration order. The stage name
/// stays out, so renaming a stage keeps its cache.
pub fn stage_fingerprint(
    base_fingerprint: &str,
    resolved: &ResolvedStage,
    source_fingerprints: &HashMap<String, Fingerprint>,
) -> BuildResult<Fingerprint> {
    #[derive(Serialize)]
    struct Input<'a> {
        base: &'a str,
        instructions: Vec<serde_json::Value>,
        args: &'a [(String, String)],
    }

    let mut instructions = Vec::with_capacity(resolved.instructions.len());
    for instruction in &resolved.instructions {
        let canonical = match instruction {
            Instruction::CopyFrom { source_stage, sources, destination, owner } => {
                let fp = source_fingerprints.get(source_stage).ok_or_else(|| {
                    BuildError::StageNotMaterialized { stage: source_stage.clone() }
                })?;
                Instruction::CopyFrom {
                    source_stage: fp.clone(),
                    sources: sources.clone(),
                    destination: destination.clone(),
                    owner: owner.clone(),
                }
            }
            other => other.clone(),
        };
        let value = serde_json::to_value(&canonical).map_err(|e| BuildError::Internal {
            message: format!("encoding instruction for fingerprint: {}", e),
        })?;
        instructions.push(value);
    }

    let input = Input {
        base: base_fingerprint,
        instructions,
        args: &resolved.args,
    };
    let bytes = serde_json::to_vec(&input).map_err(|e| BuildError::Internal {
        message: format!("encoding fingerprint input: {}", e),
    })?;
    Ok(sha256_hex(&bytes))
}

/// Runs stages and freezes their results into the snapshot store.
pub struct StageExecutor {
    store: Arc<SnapshotStore>,
    cache: Arc<SnapshotCache>,
    runner: Arc<dyn CommandRunner>,
    work_dir: PathBuf,
    no_cache: bool,
    keep_work_dirs: bool,
}

impl StageExecutor {
    pub fn new(
        store: Arc<SnapshotStore>,
        cache: Arc<SnapshotCache>,
        runner: Arc<dyn CommandRunner>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            cache,
            runner,
            work_dir,
            no_cache: false,
            keep_work_dirs: false,
        }
    }

    /// Skip the persistent cache for lookups; results are still stored.
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Keep work directories after successful stages.
    pub fn keep_work_dirs(mut self, keep: bool) -> Self {
        self.keep_work_dirs = keep;
        self
    }

    /// Satisfy one stage, from cache or by running it.
    ///
    /// `deps` maps every spelling of a dependency reference (name, alias,
    /// position) to its completed snapshot. `inherited` is the runtime
    /// metadata accumulated along the base chain; commands see its env and
    /// workdir before this stage's own instructions apply.
    #[instrument(skip_all, fields(stage = %stage.name))]
    pub async fn execute(
        &self,
        stage: &Stage,
        resolved: &ResolvedStage,
        base: Arc<Snapshot>,
        deps: &HashMap<String, Arc<Snapshot>>,
        inherited: &RuntimeMetadata,
    ) -> BuildResult<StageOutcome> {
        let source_fingerprints: HashMap<String, Fingerprint> = deps
            .iter()
            .map(|(name, snap)| (name.clone(), snap.fingerprint.clone()))
            .collect();
        let fingerprint = stage_fingerprint(&base.fingerprint, resolved, &source_fingerprints)?;

        let started = Instant::now();
        let (snapshot, status) = self
            .cache
            .get_or_execute(&fingerprint, &stage.name, self.no_cache, || {
                self.run_stage(stage, resolved, &base, deps, inherited, &fingerprint)
            })
            .await?;

        let state = match status {
            CacheStatus::Executed => StageState::Executed,
            CacheStatus::Hit | CacheStatus::Coalesced => StageState::CacheHit,
        };
        match state {
            StageState::CacheHit => info!(
                stage = %stage.name,
                fingerprint = %short_fingerprint(&fingerprint),
                "Stage satisfied from cache"
            ),
            _ => info!(
                stage = %stage.name,
                fingerprint = %short_fingerprint(&fingerprint),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage executed"
            ),
        }

        Ok(StageOutcome {
            stage_name: stage.name.clone(),
            fingerprint,
            snapshot,
            state,
            elapsed: started.elapsed(),
        })
    }

    /// Run all instructions in a fresh work directory and freeze the result.
    async fn run_stage(
        &self,
        stage: &Stage,
        resolved: &ResolvedStage,
        base: &Snapshot,
        deps: &HashMap<String, Arc<Snapshot>>,
        inherited: &RuntimeMetadata,
        fingerprint: &Fingerprint,
    ) -> BuildResult<Snapshot> {
        let work = self.work_dir.join(Uuid::new_v4().to_string());
        let root = work.join("root");
        fs::create_dir_all(&root).map_err(|e| BuildError::io(&root, e))?;

        debug!(stage = %stage.name, root = %root.display(), "Materializing base");
        let base_view = base.resolve();
        write_view(&root, &self.store, &base_view)?;

        let mut meta = inherited.clone();
        let mut owners: HashMap<String, String> = HashMap::new();

        let frozen = match self
            .apply_instructions(stage, resolved, deps, &root, &mut meta, &mut owners)
            .await
        {
            Ok(()) => self.freeze(&root, base, &base_view, &owners, fingerprint, &stage.name),
            Err(err) => Err(err),
        };

        match frozen {
            Ok(snapshot) => {
                if self.keep_work_dirs {
                    debug!(work = %work.display(), "Keeping work directory");
                } else if let Err(err) = fs::remove_dir_all(&work) {
                    warn!(
                        work = %work.display(),
                        error = %err,
                        "Failed to remove work directory"
                    );
                }
                Ok(snapshot)
            }
            Err(err) => {
                // Left in place for inspection.
                debug!(work = %work.display(), "Keeping work directory of failed stage");
                Err(err)
            }
        }
    }

    async fn apply_instructions(
        &self,
        stage: &Stage,
        resolved: &ResolvedStage,
        deps: &HashMap<String, Arc<Snapshot>>,
        root: &Path,
        meta: &mut RuntimeMetadata,
        owners: &mut HashMap<String, String>,
    ) -> BuildResult<()> {
        for (index, instruction) in resolved.instructions.iter().enumerate() {
            match instruction {
                Instruction::Run { command } => {
                    let spec = ProcessSpec {
                        stage_name: stage.name.clone(),
                        command: command.clone(),
                        env: meta.env.clone(),
                        workdir: meta.workdir_or_root().to_string(),
                    };
                    let details = self.runner.run(root, &spec).await?;
                    if !details.success() {
                        return Err(BuildError::InstructionFailed {
                            stage: stage.name.clone(),
                            index,
                            instruction: command.to_string(),
                            exit: details,
                        });
                    }
                }
                Instruction::CopyFrom { source_stage, sources, destination, owner } => {
                    let source = deps.get(source_stage).ok_or_else(|| {
                        BuildError::StageNotMaterialized { stage: source_stage.clone() }
                    })?;
                    let copied = resolve_copy(
                        root,
                        &self.store,
                        source_stage,
                        source,
                        sources,
                        destination,
                        owner.as_deref(),
                    )?;
                    owners.extend(copied);
                }
                other => meta.apply(other),
            }
        }
        Ok(())
    }

    /// Diff the work root against the base view into one delta layer.
    fn freeze(
        &self,
        root: &Path,
        base: &Snapshot,
        base_view: &BTreeMap<String, FileEntry>,
        owners: &HashMap<String, String>,
        fingerprint: &Fingerprint,
        stage_name: &str,
    ) -> BuildResult<Snapshot> {
        let mut current = scan_dir(root, &self.store)?;

        // Ownership is metadata; the disk never carries it. Overrides from
        // this stage's copies win, otherwise the base's record survives.
        for (path, entry) in current.iter_mut() {
            entry.owner = owners
                .get(path)
                .cloned()
                .or_else(|| base_view.get(path).and_then(|prev| prev.owner.clone()));
        }

        let mut layer = Layer::default();
        for (path, entry) in &current {
            if base_view.get(path) != Some(entry) {
                layer.entries.insert(path.clone(), entry.clone());
            }
        }
        for path in base_view.keys() {
            if !current.contains_key(path) && !ancestor_removed(&layer.removed, path) {
                layer.removed.insert(path.clone());
            }
        }

        debug!(
            stage = %stage_name,
            added = layer.entries.len(),
            removed = layer.removed.len(),
            "Froze stage layer"
        );
        Ok(Snapshot::derive(base, stage_name, fingerprint.clone(), layer))
    }
}

/// True if some strict ancestor of `path` is already in `removed`.
fn ancestor_removed(removed: &BTreeSet<String>, path: &str) -> bool {
    let mut prefix = path;
    while let Some(idx) = prefix.rfind('/') {
        if idx == 0 {
            return false;
        }
        prefix = &prefix[..idx];
        if removed.contains(prefix) {
            return true;
        }
    }
    false
}
