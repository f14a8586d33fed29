// src/dag/mod.rs

//! Stage DAG representation and dependency-ordered submission.
//!
//! - [`graph`] holds the stage arena and its traversals.
//! - [`loader`] obtains a graph from the manifest or an external DOT command.
//! - [`submitter`] hands runnable stages to a task system in order.

pub mod graph;
pub mod loader;
pub mod submitter;

pub use graph::{Stage, StageGraph, StageId, StageKind, StageName};
pub use loader::{DotCommandSource, GraphSource, ManifestSource, load_graph, parse_dot};
pub use submitter::{Submission, TaskSubmitter, submit_graph};
