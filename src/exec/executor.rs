// src/exec/executor.rs

//! Per-stage unit of work: dry run, run-cache restore, execute, commit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dag::{Stage, StageGraph, StageName};
use crate::errors::{Result, StagehandError};
use crate::exec::retry::{RetryPolicy, offload, run_locked};
use crate::exec::runner::CommandRunner;
use crate::store::MetadataStore;
use crate::workspace::WorkspaceManager;

/// How a stage was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The command ran and its outputs were committed.
    Executed,
    /// Outputs already matched the committed state.
    Skipped,
    /// Outputs were checked out of the run cache.
    CacheHit,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageOutcome::Executed => "executed",
            StageOutcome::Skipped => "skipped",
            StageOutcome::CacheHit => "cache-hit",
        };
        f.write_str(s)
    }
}

/// Result of one successful [`StageExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageName,
    pub outcome: StageOutcome,
    /// Stages the dry run found stale (`[stage]` when forced, empty when
    /// skipped).
    pub affected: Vec<StageName>,
    /// Runnable stages this result builds on, upstream first, ending with
    /// `stage` itself.
    pub lineage: Vec<StageName>,
}

/// Per-stage isolation: the manager that prepares workspaces and the graph
/// used to resolve upstream stages inside them.
#[derive(Debug, Clone)]
struct Isolation {
    manager: Arc<WorkspaceManager>,
    graph: Arc<StageGraph>,
}

/// Brings single stages up to date against a metadata store.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    store: Arc<dyn MetadataStore>,
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    isolation: Option<Isolation>,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        runner: Arc<dyn CommandRunner>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            runner,
            retry,
            isolation: None,
        }
    }

    /// Run every stage in its own workspace prepared by `manager`.
    pub fn with_isolation(mut self, manager: Arc<WorkspaceManager>, graph: Arc<StageGraph>) -> Self {
        self.isolation = Some(Isolation { manager, graph });
        self
    }

    /// Bring `stage` up to date.
    ///
    /// 1. Unless `force`, dry run; nothing stale means `Skipped`.
    /// 2. Unless `force`, try the run cache; a hit means `CacheHit`.
    /// 3. Run the command; non-zero exit is `StageExecutionFailed`.
    /// 4. Commit the outputs: `Executed`.
    ///
    /// Dry run, restore and commit go through the locked retry protocol. The
    /// command itself is never retried.
    pub async fn execute(
        &self,
        stage: &Stage,
        force: bool,
        upstream: &[StageReport],
    ) -> Result<StageReport> {
        let Some(isolation) = &self.isolation else {
            return self.execute_in(&self.store, stage, force, upstream).await;
        };

        let dir = isolation
            .manager
            .prepare(self.store.root(), None)
            .await?;
        debug!(stage = %stage.name, workspace = ?dir, "executing in isolated workspace");

        let result = async {
            let store = self.store.open_at(&dir)?;
            self.restore_upstream(&store, &isolation.graph, upstream).await?;
            self.execute_in(&store, stage, force, upstream).await
        }
        .await;

        isolation.manager.release(&dir).await;
        result
    }

    async fn execute_in(
        &self,
        store: &Arc<dyn MetadataStore>,
        stage: &Stage,
        force: bool,
        upstream: &[StageReport],
    ) -> Result<StageReport> {
        let name = &stage.name;
        let Some(cmd) = stage.command() else {
            debug!(stage = %name, "data-only stage; nothing to execute");
            return Ok(report(stage, StageOutcome::Skipped, Vec::new(), upstream));
        };

        let affected = if force {
            vec![name.clone()]
        } else {
            run_locked(&self.retry, "dry run", || store.is_locked(), || {
                let (store, stage) = (store.clone(), stage.clone());
                offload("dry run", move || store.dry_run(&stage))
            })
            .await?
        };

        if !force {
            if affected.is_empty() {
                info!(stage = %name, "stage is up to date; skipping");
                return Ok(report(stage, StageOutcome::Skipped, affected, upstream));
            }

            match run_locked(
                &self.retry,
                "run-cache restore",
                || store.is_locked(),
                || restore(store, stage),
            )
            .await
            {
                Ok(()) => {
                    info!(stage = %name, "restored outputs from run cache");
                    return Ok(report(stage, StageOutcome::CacheHit, affected, upstream));
                }
                Err(StagehandError::RunCacheMiss(_)) => {
                    debug!(stage = %name, "run-cache miss");
                }
                Err(e) => return Err(e),
            }
        }

        let exit_code = self
            .runner
            .run(name, cmd, store.root(), &stage.params)
            .await?;
        if exit_code != 0 {
            warn!(stage = %name, exit_code, "stage command failed");
            return Err(StagehandError::StageExecutionFailed {
                stage: name.clone(),
                exit_code,
            });
        }

        run_locked(&self.retry, "commit", || store.is_locked(), || {
            let (store, stage) = (store.clone(), stage.clone());
            offload("commit", move || store.commit(&stage))
        })
        .await?;
        info!(stage = %name, "stage executed and committed");
        Ok(report(stage, StageOutcome::Executed, affected, upstream))
    }

    /// Check upstream outputs out of the shared run cache inside an isolated
    /// workspace, in dependency order.
    async fn restore_upstream(
        &self,
        store: &Arc<dyn MetadataStore>,
        graph: &StageGraph,
        upstream: &[StageReport],
    ) -> Result<()> {
        for name in merged_lineage(upstream) {
            let Some(stage) = graph.stage(&name) else {
                continue;
            };
            let restored = run_locked(
                &self.retry,
                "upstream restore",
                || store.is_locked(),
                || restore(store, stage),
            )
            .await;
            match restored {
                Ok(()) => debug!(stage = %name, "restored upstream outputs"),
                // Outputs that were already up to date came along with the clone.
                Err(StagehandError::RunCacheMiss(_)) => {
                    debug!(stage = %name, "no cached upstream outputs to restore")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Offloaded run-cache restore of `stage` into `store`'s workspace.
pub(crate) async fn restore(store: &Arc<dyn MetadataStore>, stage: &Stage) -> Result<()> {
    let (store, stage) = (store.clone(), stage.clone());
    offload("run-cache restore", move || store.restore_run_cache(&stage)).await
}

fn merged_lineage(upstream: &[StageReport]) -> Vec<StageName> {
    let mut lineage: Vec<StageName> = Vec::new();
    for rep in upstream {
        for name in rep.lineage.iter() {
            if !lineage.contains(name) {
                lineage.push(name.clone());
            }
        }
    }
    lineage
}

fn report(
    stage: &Stage,
    outcome: StageOutcome,
    affected: Vec<StageName>,
    upstream: &[StageReport],
) -> StageReport {
    let mut lineage = merged_lineage(upstream);
    lineage.push(stage.name.clone());
    StageReport {
        stage: stage.name.clone(),
        outcome,
        affected,
        lineage,
    }
}
