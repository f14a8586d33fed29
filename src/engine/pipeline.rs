// src/engine/pipeline.rs

//! Reproducing a stage graph end to end.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dag::{DotCommandSource, GraphSource, ManifestSource, StageGraph, load_graph, submit_graph};
use crate::engine::aggregator::{RunSummary, wait_all};
use crate::errors::Result;
use crate::exec::executor::restore;
use crate::exec::{CommandRunner, RetryPolicy, StageExecutor, StageOutcome, WorkerPool, run_locked};
use crate::store::{MetadataStore, Repository};
use crate::types::{ClonerKind, FailurePolicy, IsolationMode};
use crate::workspace::{WorkspaceManager, cloner_for};

/// Everything one reproduce run needs, merged from settings and CLI flags.
#[derive(Debug, Clone)]
pub struct ReproOptions {
    /// Restrict to these stages and their ancestors; empty means all.
    pub targets: Vec<String>,
    pub force: bool,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub isolation: IsolationMode,
    pub cleanup: bool,
    pub consolidate: bool,
    pub cloner: ClonerKind,
    /// Obtain the graph from this DOT-printing command instead of
    /// `pipeline.toml`.
    pub source_cmd: Option<String>,
}

impl Default for ReproOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ReproOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let workers = settings.exec.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self {
            targets: Vec::new(),
            force: false,
            workers,
            retry: RetryPolicy::from_settings(&settings.exec),
            failure_policy: settings.exec.failure_policy,
            isolation: settings.exec.isolation,
            cleanup: settings.exec.cleanup,
            consolidate: settings.exec.consolidate,
            cloner: settings.queue.cloner,
            source_cmd: None,
        }
    }

    pub fn graph_source(&self) -> Box<dyn GraphSource> {
        match &self.source_cmd {
            Some(cmd) => Box::new(DotCommandSource::new(cmd.clone())),
            None => Box::new(ManifestSource),
        }
    }
}

/// Reproduce the pipeline of the workspace at `root`.
pub async fn reproduce(
    root: &Path,
    options: &ReproOptions,
    runner: Arc<dyn CommandRunner>,
) -> Result<RunSummary> {
    let store: Arc<dyn MetadataStore> = Arc::new(Repository::open(root)?);
    reproduce_with(store, options, runner).await
}

/// Reproduce against an explicit metadata store.
///
/// Graph loading and target resolution errors are returned directly; stage
/// failures end up in the summary.
pub async fn reproduce_with(
    store: Arc<dyn MetadataStore>,
    options: &ReproOptions,
    runner: Arc<dyn CommandRunner>,
) -> Result<RunSummary> {
    let source = options.graph_source();
    let graph = Arc::new(load_graph(
        source.as_ref(),
        Some(store.root()),
        &options.targets,
    )?);
    info!(
        stages = graph.len(),
        isolation = ?options.isolation,
        force = options.force,
        "reproducing pipeline"
    );

    let mut summary = run_graph(&store, &graph, options, &runner).await?;

    if options.isolation == IsolationMode::PerStage && options.consolidate {
        if summary.all_succeeded() && !summary.is_empty() {
            info!("consolidating results into the primary workspace");
            consolidate(&store, &graph, &summary, &options.retry).await?;
            summary.consolidated = true;
        } else if !summary.all_succeeded() {
            warn!("not consolidating: some stages failed");
        }
    }

    Ok(summary)
}

/// Check the results of an isolated run out of the shared run cache into the
/// primary workspace, upstream first.
///
/// Only stages that executed or were restored in their clone are touched.
/// Their run-cache entries are authoritative, so the primary's dry run is not
/// consulted: after a forced run the primary still matches its old record.
async fn consolidate(
    store: &Arc<dyn MetadataStore>,
    graph: &StageGraph,
    summary: &RunSummary,
    retry: &RetryPolicy,
) -> Result<()> {
    for id in graph.topological_order()? {
        let stage = graph.get(id);
        if !matches!(
            summary.outcome(&stage.name),
            Some(StageOutcome::Executed | StageOutcome::CacheHit)
        ) {
            continue;
        }

        run_locked(retry, "consolidate", || store.is_locked(), || restore(store, stage)).await?;
        debug!(stage = %stage.name, "consolidated stage outputs");
    }
    Ok(())
}

async fn run_graph(
    store: &Arc<dyn MetadataStore>,
    graph: &Arc<StageGraph>,
    options: &ReproOptions,
    runner: &Arc<dyn CommandRunner>,
) -> Result<RunSummary> {
    let mut executor = StageExecutor::new(store.clone(), runner.clone(), options.retry);
    if options.isolation == IsolationMode::PerStage {
        let manager = WorkspaceManager::new(cloner_for(options.cloner), options.cleanup);
        executor = executor.with_isolation(Arc::new(manager), graph.clone());
    }

    let mut pool = WorkerPool::new(executor, options.workers, options.force);
    let submission = submit_graph(graph, &[], &mut pool)?;
    info!(
        submitted = submission.len(),
        data_only = submission.passed_through.len(),
        "submitted stages"
    );

    Ok(wait_all(submission.handles, options.failure_policy).await)
}
