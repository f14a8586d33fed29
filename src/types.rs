use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the aggregator does when one of the submitted stages fails.
///
/// - `CollectAll`: keep awaiting every other handle and report the complete
///   picture (default).
/// - `FailFast`: stop waiting at the first failure. Stages that were already
///   dispatched still run to completion; nothing is cancelled mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[serde(alias = "collect")]
    CollectAll,
    FailFast,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::CollectAll
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "collect" | "collect-all" => Ok(FailurePolicy::CollectAll),
            "fail-fast" | "failfast" => Ok(FailurePolicy::FailFast),
            other => Err(format!(
                "invalid failure_policy: {other} (expected \"collect\" or \"fail-fast\")"
            )),
        }
    }
}

/// Where stage commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Every stage runs in the base workspace; concurrent metadata mutation is
    /// serialized by the repository lock.
    Shared,
    /// Every stage runs in its own disposable clone that shares the cache.
    PerStage,
}

impl Default for IsolationMode {
    fn default() -> Self {
        IsolationMode::Shared
    }
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared" => Ok(IsolationMode::Shared),
            "per-stage" | "per_stage" => Ok(IsolationMode::PerStage),
            other => Err(format!(
                "invalid isolation: {other} (expected \"shared\" or \"per-stage\")"
            )),
        }
    }
}

/// How queued experiments are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// One experiment at a time, in queue order.
    Sequential,
    /// All selected experiments at once.
    Parallel,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Parallel
    }
}

/// Which mechanism creates isolated workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClonerKind {
    /// Plain filesystem copy of the working tree.
    Copy,
    /// `git clone` plus the uncommitted diff.
    Git,
}

impl Default for ClonerKind {
    fn default() -> Self {
        ClonerKind::Copy
    }
}
