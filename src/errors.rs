// src/errors.rs

//! Crate-wide error type and result alias.

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    #[error("Stage graph unavailable: {0}")]
    GraphUnavailable(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Cycle detected in stage graph: {0}")]
    DagCycle(String),

    #[error("Repository lock at {0} is held by another process")]
    LockContention(String),

    #[error("Repository metadata is invalid: {0}")]
    MetadataInvalid(String),

    #[error("Giving up on '{operation}' after {attempts} attempts: {source}")]
    LockAcquisitionFailed {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StagehandError>,
    },

    #[error("Stage '{stage}' failed with exit code {exit_code}")]
    StageExecutionFailed { stage: String, exit_code: i32 },

    #[error("No run-cache entry for stage '{0}'")]
    RunCacheMiss(String),

    #[error("Stage '{stage}' not run because an upstream stage failed: {reason}")]
    UpstreamFailed { stage: String, reason: String },

    #[error("Workspace setup failed: {0}")]
    WorkspaceSetupFailed(String),

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StagehandError {
    /// Errors the locked-retry loop may swallow and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StagehandError::LockContention(_) | StagehandError::MetadataInvalid(_)
        )
    }
}

/// Error type shared between a task and every dependent awaiting it.
pub type SharedError = Arc<StagehandError>;

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, StagehandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_and_metadata_errors_are_transient() {
        assert!(StagehandError::LockContention(".stagehand/lock".into()).is_transient());
        assert!(StagehandError::MetadataInvalid("truncated".into()).is_transient());
        assert!(
            !StagehandError::StageExecutionFailed {
                stage: "train".into(),
                exit_code: 2
            }
            .is_transient()
        );
        assert!(!StagehandError::RunCacheMiss("train".into()).is_transient());
    }
}
