// src/engine/aggregator.rs

//! Waiting on submitted stages and summarizing the outcome.

use std::fmt;
use std::future::Future;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{error, info, warn};

use crate::dag::StageName;
use crate::errors::{SharedError, StagehandError};
use crate::exec::{StageOutcome, StageReport, TaskResult};
use crate::types::FailurePolicy;

/// What happened to every stage of one run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub reports: Vec<StageReport>,
    pub failed: Vec<(StageName, SharedError)>,
    /// Stages still in flight when a fail-fast run stopped waiting.
    pub abandoned: Vec<StageName>,
    /// Whether results were consolidated into the primary workspace.
    pub consolidated: bool,
}

impl RunSummary {
    fn names(&self, outcome: StageOutcome) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.stage.as_str())
            .collect()
    }

    pub fn executed(&self) -> Vec<&str> {
        self.names(StageOutcome::Executed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names(StageOutcome::Skipped)
    }

    pub fn cache_hits(&self) -> Vec<&str> {
        self.names(StageOutcome::CacheHit)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.failed.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn report(&self, stage: &str) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }

    pub fn outcome(&self, stage: &str) -> Option<StageOutcome> {
        self.report(stage).map(|r| r.outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty() && self.failed.is_empty() && self.abandoned.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }

    /// The failure to report to the user: the first one that is not merely a
    /// consequence of an upstream failure.
    pub fn first_failure(&self) -> Option<&(StageName, SharedError)> {
        self.failed
            .iter()
            .find(|(_, e)| !matches!(e.as_ref(), StagehandError::UpstreamFailed { .. }))
            .or_else(|| self.failed.first())
    }

    /// `Ok(self)` when every stage succeeded, otherwise the first failure.
    pub fn into_result(self) -> Result<RunSummary, SharedError> {
        match self.first_failure() {
            Some((_, err)) => Err(err.clone()),
            None => Ok(self),
        }
    }

    fn record(&mut self, stage: StageName, result: TaskResult) {
        match result {
            Ok(report) => {
                info!(stage = %stage, outcome = %report.outcome, "stage finished");
                self.reports.push(report);
            }
            Err(err) => {
                error!(stage = %stage, error = %err, "stage failed");
                self.failed.push((stage, err));
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn line(f: &mut fmt::Formatter<'_>, label: &str, names: &[&str]) -> fmt::Result {
            if names.is_empty() {
                writeln!(f, "{label:>10}: -")
            } else {
                writeln!(f, "{label:>10}: {}", names.join(", "))
            }
        }

        line(f, "executed", &self.executed())?;
        line(f, "skipped", &self.skipped())?;
        line(f, "cache-hit", &self.cache_hits())?;
        line(f, "failed", &self.failed())?;
        if !self.abandoned.is_empty() {
            let names: Vec<&str> = self.abandoned.iter().map(String::as_str).collect();
            line(f, "abandoned", &names)?;
        }
        for (stage, err) in self.failed.iter() {
            writeln!(f, "  {stage}: {err}")?;
        }
        Ok(())
    }
}

/// Wait on every handle and collect the outcome.
///
/// With [`FailurePolicy::CollectAll`] every handle is awaited so the summary
/// is complete. With [`FailurePolicy::FailFast`] waiting stops at the first
/// failure; the stages not yet finished are listed as abandoned but keep
/// running in the background.
pub async fn wait_all<H>(handles: Vec<(StageName, H)>, policy: FailurePolicy) -> RunSummary
where
    H: Future<Output = TaskResult>,
{
    let mut summary = RunSummary::default();

    match policy {
        FailurePolicy::CollectAll => {
            for (stage, handle) in handles {
                let result = handle.await;
                summary.record(stage, result);
            }
        }
        FailurePolicy::FailFast => {
            let mut outstanding: Vec<StageName> = handles.iter().map(|(n, _)| n.clone()).collect();
            let mut pending: FuturesUnordered<_> = handles
                .into_iter()
                .map(|(stage, handle)| async move { (stage, handle.await) })
                .collect();

            while let Some((stage, result)) = pending.next().await {
                outstanding.retain(|n| n != &stage);
                let failed = result.is_err();
                summary.record(stage, result);
                if failed {
                    warn!(remaining = outstanding.len(), "fail-fast: no longer waiting");
                    summary.abandoned = outstanding;
                    break;
                }
            }
        }
    }

    summary
}
