//! Whole-pipeline orchestration.
//!
//! `build_image` takes a pipeline definition from file to registered
//! image descriptor: parse, graph validation, argument resolution,
//! wave-by-wave stage execution, and final assembly. All definition and
//! resolution errors surface before anything touches the data
//! directory.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::builder::args::{resolve_base_ref, resolve_stage, ArgumentScope, ResolvedStage};
use crate::builder::assemble::{assemble, register_image, ImageDescriptor, RuntimeMetadata};
use crate::builder::base::{base_fingerprint, BaseProvider, LocalBaseProvider};
use crate::builder::cache::SnapshotCache;
use crate::builder::exec::{CommandRunner, ShellRunner};
use crate::builder::executor::{
    BuildError, BuildResult, StageExecutor, StageOutcome, StageState,
};
use crate::builder::graph::StageGraph;
use crate::builder::parser::{parse_pipeline_file, BaseRef, Pipeline, Stage};
use crate::builder::snapshot::{Fingerprint, Snapshot};
use crate::builder::store::SnapshotStore;
use crate::paths;

/// Everything a single build needs. Construct with [`BuildOptions::new`]
/// and override fields as needed.
#[derive(Clone)]
pub struct BuildOptions {
    /// Path to the pipeline definition file.
    pub pipeline: PathBuf,
    /// Pipeline argument overrides, `name -> value`.
    pub args: HashMap<String, String>,
    /// Stage to build. Defaults to the last stage in the file.
    pub target: Option<String>,
    /// Ignore stored snapshots and re-run every required stage.
    pub no_cache: bool,
    /// Require an entrypoint or default command on the final stage.
    pub runnable: bool,
    /// Data directory override, mainly for tests.
    pub data_dir: Option<PathBuf>,
    /// Upper bound on concurrently running stages.
    pub max_concurrent: usize,
    /// Keep stage work directories after success, for inspection.
    pub keep_work_dirs: bool,
    /// Command runner override. `None` spawns real processes.
    pub runner: Option<Arc<dyn CommandRunner>>,
}

impl BuildOptions {
    pub fn new(pipeline: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: pipeline.into(),
            args: HashMap::new(),
            target: None,
            no_cache: false,
            runnable: true,
            data_dir: None,
            max_concurrent: 4,
            keep_work_dirs: false,
            runner: None,
        }
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub descriptor: ImageDescriptor,
    pub stats: BuildStats,
    /// Outcome of every stage that ran, in declaration order.
    pub stages: Vec<StageReport>,
}

/// How one stage was satisfied.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub state: StageState,
    pub fingerprint: Fingerprint,
    pub elapsed_ms: u64,
}

/// Per-build counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Stages defined in the pipeline.
    pub stages_total: usize,
    /// Stages whose instructions actually ran.
    pub stages_executed: usize,
    /// Stages satisfied from the snapshot store.
    pub stages_cached: usize,
    /// Stages never run: not required for the target, or abandoned
    /// after a failure.
    pub stages_skipped: usize,
    /// Wall-clock build time.
    pub duration_ms: u64,
}

/// Shared handles for the stage tasks of one build.
struct BuildContext {
    cache: Arc<SnapshotCache>,
    provider: Arc<LocalBaseProvider>,
    executor: Arc<StageExecutor>,
    semaphore: Arc<Semaphore>,
    no_cache: bool,
}

/// Where a stage's base filesystem comes from.
enum StageBase {
    /// Built by an earlier stage in this run.
    Ready(Arc<Snapshot>),
    /// External or scratch, fetched through the cache.
    Fetch(BaseRef),
}

/// Inputs for one stage task, cloned out of the shared tables before
/// the task is spawned.
struct StageJob {
    stage: Stage,
    resolved: ResolvedStage,
    base: StageBase,
    deps: HashMap<String, Arc<Snapshot>>,
    inherited: RuntimeMetadata,
}

/// Build the pipeline's target stage into a registered image.
///
/// Stages run wave by wave: every stage in a wave has all dependencies
/// satisfied by earlier waves, so the whole wave is spawned at once and
/// throttled by `max_concurrent`. When any stage fails, no later wave
/// starts, already-running stages finish, and the first failure in
/// declaration order is returned.
#[instrument(skip_all, fields(pipeline = %options.pipeline.display()))]
pub async fn build_image(options: BuildOptions) -> crate::Result<BuildReport> {
    let started = Instant::now();

    let pipeline = parse_pipeline_file(&options.pipeline)?;
    let graph = StageGraph::build(&pipeline)?;

    let target = match &options.target {
        Some(name) => pipeline
            .stage_index(name)
            .ok_or_else(|| BuildError::UnknownTargetStage { target: name.clone() })?,
        None => pipeline.stages.len() - 1,
    };
    let target_name = pipeline.stages[target].name.clone();
    info!(
        target = %target_name,
        stages = pipeline.stages.len(),
        "Starting build"
    );

    let required = graph.required_for(target);
    let waves = graph.waves(&required);

    // Resolve every required stage up front. Argument and base errors
    // must surface before a single instruction runs.
    let pipeline_scope = ArgumentScope::pipeline(&pipeline, &options.args);
    let mut resolved: HashMap<usize, ResolvedStage> = HashMap::new();
    let mut bases: HashMap<usize, BaseRef> = HashMap::new();
    let mut states: HashMap<usize, StageState> = HashMap::new();
    for idx in 0..pipeline.stages.len() {
        states.insert(idx, StageState::Defined);
        if !required.contains(&idx) {
            continue;
        }
        let stage = &pipeline.stages[idx];
        bases.insert(idx, resolve_base_ref(&pipeline_scope, stage)?);
        resolved.insert(idx, resolve_stage(stage, &pipeline, &options.args)?);
        transition(&mut states, &pipeline, idx, StageState::GraphValidated);
    }

    // Runtime metadata folds along the base chain independently of
    // execution, so cache hits describe the image identically.
    let mut inherited: HashMap<usize, RuntimeMetadata> = HashMap::new();
    let mut full: HashMap<usize, RuntimeMetadata> = HashMap::new();
    let mut ordered: Vec<usize> = required.iter().copied().collect();
    ordered.sort_unstable();
    for idx in ordered {
        let from_base = match &pipeline.stages[idx].base {
            BaseRef::Stage(reference) => {
                let base_idx = stage_index(&pipeline, reference)?;
                required_entry(&full, base_idx, "runtime metadata")?.clone()
            }
            _ => RuntimeMetadata::default(),
        };
        let mut meta = from_base.clone();
        meta.apply_all(&required_entry(&resolved, idx, "resolved stage")?.instructions);
        inherited.insert(idx, from_base);
        full.insert(idx, meta);
    }

    // Only now touch the filesystem.
    let data_dir = options.data_dir.clone().unwrap_or_else(paths::data_dir);
    let store = Arc::new(SnapshotStore::open(&paths::store_dir_in(&data_dir))?);
    let cache = Arc::new(SnapshotCache::new(store.clone()));
    let provider = Arc::new(LocalBaseProvider::new(
        paths::bases_dir_in(&data_dir),
        store.clone(),
    ));
    let runner: Arc<dyn CommandRunner> = match &options.runner {
        Some(runner) => runner.clone(),
        None => Arc::new(ShellRunner),
    };
    let executor = Arc::new(
        StageExecutor::new(store, cache.clone(), runner, paths::work_dir_in(&data_dir))
            .no_cache(options.no_cache)
            .keep_work_dirs(options.keep_work_dirs),
    );
    let ctx = Arc::new(BuildContext {
        cache,
        provider,
        executor,
        semaphore: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
        no_cache: options.no_cache,
    });

    let mut stats = BuildStats {
        stages_total: pipeline.stages.len(),
        stages_skipped: pipeline.stages.len() - required.len(),
        ..BuildStats::default()
    };
    let mut completed: HashMap<usize, StageOutcome> = HashMap::new();

    for (wave_number, wave) in waves.iter().enumerate() {
        debug!(wave = wave_number, stages = wave.len(), "Scheduling wave");
        let mut join_set: JoinSet<(usize, BuildResult<StageOutcome>)> = JoinSet::new();

        for &idx in wave {
            let job = StageJob {
                stage: pipeline.stages[idx].clone(),
                resolved: required_entry(&resolved, idx, "resolved stage")?.clone(),
                base: stage_base(&pipeline, idx, &bases, &completed)?,
                deps: dependency_snapshots(&graph, &pipeline, idx, &completed)?,
                inherited: required_entry(&inherited, idx, "runtime metadata")?.clone(),
            };
            transition(&mut states, &pipeline, idx, StageState::Executing);

            let ctx = ctx.clone();
            join_set.spawn(async move { (idx, run_stage_task(ctx, job).await) });
        }

        let mut failures: Vec<(usize, BuildError)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (idx, result) = joined.map_err(|e| BuildError::Internal {
                message: format!("stage task panicked: {}", e),
            })?;
            match result {
                Ok(outcome) => {
                    transition(&mut states, &pipeline, idx, outcome.state);
                    match outcome.state {
                        StageState::CacheHit => stats.stages_cached += 1,
                        _ => stats.stages_executed += 1,
                    }
                    completed.insert(idx, outcome);
                }
                Err(error) => {
                    transition(&mut states, &pipeline, idx, StageState::Failed);
                    failures.push((idx, error));
                }
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|(idx, _)| *idx);
            report_abandoned(&pipeline, &graph, &required, &completed, &failures);
            let (_, error) = failures.swap_remove(0);
            return Err(error.into());
        }
    }

    let mut stage_reports = Vec::with_capacity(required.len());
    let mut ordered: Vec<usize> = required.iter().copied().collect();
    ordered.sort_unstable();
    for idx in ordered {
        let outcome = required_entry(&completed, idx, "stage outcome")?;
        stage_reports.push(StageReport {
            name: outcome.stage_name.clone(),
            state: outcome.state,
            fingerprint: outcome.fingerprint.clone(),
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        });
    }

    let outcome = completed.remove(&target).ok_or_else(|| BuildError::Internal {
        message: format!("target stage '{}' never completed", target_name),
    })?;
    let metadata = required_entry(&full, target, "runtime metadata")?;
    let descriptor = assemble(&target_name, outcome.snapshot.as_ref(), metadata, options.runnable)?;
    register_image(&paths::images_dir_in(&data_dir), &descriptor)?;

    stats.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        image = %descriptor.short_id(),
        executed = stats.stages_executed,
        cached = stats.stages_cached,
        skipped = stats.stages_skipped,
        elapsed_ms = stats.duration_ms,
        "Build complete"
    );
    Ok(BuildReport { descriptor, stats, stages: stage_reports })
}

/// One spawned stage: wait for a slot, settle the base, run.
async fn run_stage_task(ctx: Arc<BuildContext>, job: StageJob) -> BuildResult<StageOutcome> {
    let _permit =
        ctx.semaphore.clone().acquire_owned().await.map_err(|_| BuildError::Internal {
            message: "stage scheduler stopped".to_string(),
        })?;

    let base = match job.base {
        StageBase::Ready(snapshot) => snapshot,
        StageBase::Fetch(base_ref) => {
            let fingerprint = base_fingerprint(&base_ref);
            let (snapshot, _) = ctx
                .cache
                .get_or_execute(&fingerprint, &base_ref.canonical(), ctx.no_cache, || {
                    ctx.provider.fetch(&base_ref, &fingerprint)
                })
                .await?;
            snapshot
        }
    };

    ctx.executor.execute(&job.stage, &job.resolved, base, &job.deps, &job.inherited).await
}

/// Settle where a stage's base comes from before its task spawns.
/// Stage bases are taken from this run's completed outcomes; everything
/// else is fetched inside the task so imports overlap.
fn stage_base(
    pipeline: &Pipeline,
    idx: usize,
    bases: &HashMap<usize, BaseRef>,
    completed: &HashMap<usize, StageOutcome>,
) -> BuildResult<StageBase> {
    match required_entry(bases, idx, "base reference")? {
        BaseRef::Stage(reference) => {
            let base_idx = stage_index(pipeline, reference)?;
            let outcome = completed.get(&base_idx).ok_or_else(|| BuildError::Internal {
                message: format!("base stage '{}' scheduled out of order", reference),
            })?;
            Ok(StageBase::Ready(outcome.snapshot.clone()))
        }
        other => Ok(StageBase::Fetch(other.clone())),
    }
}

/// Snapshots of every dependency, keyed by each spelling a `copy-from`
/// may use: stage name, alias, and position.
fn dependency_snapshots(
    graph: &StageGraph,
    pipeline: &Pipeline,
    idx: usize,
    completed: &HashMap<usize, StageOutcome>,
) -> BuildResult<HashMap<String, Arc<Snapshot>>> {
    let mut deps = HashMap::new();
    for &dep in graph.dependencies_of(idx) {
        let outcome = completed.get(&dep).ok_or_else(|| BuildError::Internal {
            message: format!("dependency of stage {} scheduled out of order", idx),
        })?;
        let stage = &pipeline.stages[dep];
        deps.insert(stage.name.clone(), outcome.snapshot.clone());
        if let Some(alias) = &stage.alias {
            deps.insert(alias.clone(), outcome.snapshot.clone());
        }
        deps.insert(dep.to_string(), outcome.snapshot.clone());
    }
    Ok(deps)
}

/// After a failed wave, name every required stage that will never run
/// and why. Purely informational; the build returns the first failure.
fn report_abandoned(
    pipeline: &Pipeline,
    graph: &StageGraph,
    required: &HashSet<usize>,
    completed: &HashMap<usize, StageOutcome>,
    failures: &[(usize, BuildError)],
) {
    let mut blocked: HashSet<usize> = failures.iter().map(|(idx, _)| *idx).collect();
    let mut ordered: Vec<usize> = required.iter().copied().collect();
    ordered.sort_unstable();

    for idx in ordered {
        if completed.contains_key(&idx) || blocked.contains(&idx) {
            continue;
        }
        let stage = pipeline.stages[idx].name.clone();
        let failed_dep =
            graph.dependencies_of(idx).iter().copied().find(|dep| blocked.contains(dep));
        let error = match failed_dep {
            Some(dep) => {
                blocked.insert(idx);
                BuildError::DependencyFailed {
                    stage,
                    dependency: pipeline.stages[dep].name.clone(),
                }
            }
            None => BuildError::Canceled { stage },
        };
        warn!(error = %error, "Stage will not run");
    }
}

fn stage_index(pipeline: &Pipeline, reference: &str) -> BuildResult<usize> {
    pipeline.stage_index(reference).ok_or_else(|| BuildError::Internal {
        message: format!("unknown stage reference '{}'", reference),
    })
}

fn required_entry<'a, T>(
    map: &'a HashMap<usize, T>,
    idx: usize,
    what: &str,
) -> BuildResult<&'a T> {
    map.get(&idx).ok_or_else(|| BuildError::Internal {
        message: format!("{} missing for stage {}", what, idx),
    })
}

fn transition(
    states: &mut HashMap<usize, StageState>,
    pipeline: &Pipeline,
    idx: usize,
    to: StageState,
) {
    let previous = states.insert(idx, to);
    debug!(
        stage = %pipeline.stages[idx].name,
        from = previous.map(|s| s.as_str()).unwrap_or("-"),
        to = %to,
        "Stage state"
    );
}
