// src/workspace/mod.rs

//! Isolated workspaces.
//!
//! - [`cloner`]: how a copy of the working tree is made (filesystem copy or
//!   git) and how revisions are captured for the experiment queue.
//! - [`manager`]: prepare/cleanup of `.stagehand/tmp/` workspaces that share
//!   the base workspace's cache.

pub mod cloner;
pub mod manager;

pub use cloner::{CopyCloner, GitCloner, WorkspaceCloner, cloner_for};
pub use manager::WorkspaceManager;
