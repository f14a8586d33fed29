// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::{FailurePolicy, IsolationMode};

/// Command-line arguments for `stagehand`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Reproduce a DAG of pipeline stages in parallel with a shared run cache.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STAGEHAND_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    /// Run as if started in DIR.
    #[arg(short = 'C', value_name = "DIR", global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create `.stagehand/` with default settings.
    Init,

    /// Print the stages in submission order.
    Dag {
        /// Restrict to these stages and their ancestors.
        targets: Vec<String>,

        /// Read the graph from a command printing a DOT digraph.
        #[arg(long, value_name = "CMD")]
        source_cmd: Option<String>,
    },

    /// Bring stages up to date.
    Repro(ReproArgs),

    /// Manage the experiment queue.
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Run queued experiments.
    Run {
        /// Only run these experiments (default: all queued).
        #[arg(long = "name", value_name = "NAME")]
        names: Vec<String>,

        /// One experiment at a time instead of all at once.
        #[arg(long)]
        sequential: bool,

        /// Keep experiment workspaces for inspection.
        #[arg(long)]
        no_cleanup: bool,

        /// Move failed experiments to the rejected list.
        #[arg(long)]
        reject_failed: bool,
    },

    /// Check a collected experiment's outputs out into the workspace.
    Apply {
        name: String,
    },

    /// Make an isolated copy of a workspace that shares its cache.
    Clone {
        source: PathBuf,
        target: PathBuf,

        /// Use `git clone` plus the uncommitted diff instead of a file copy.
        #[arg(long)]
        git: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ReproArgs {
    /// Stages to reproduce (with their ancestors). Default: all.
    pub targets: Vec<String>,

    /// Run commands even if outputs are up to date.
    #[arg(short, long)]
    pub force: bool,

    /// Number of stages running at once.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Attempts for lock-guarded metadata updates.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Run every stage in its own isolated workspace.
    #[arg(long, conflicts_with = "isolation")]
    pub isolate: bool,

    /// Where stage commands run: `shared` or `per-stage`.
    #[arg(long, value_name = "MODE", value_parser = IsolationMode::from_str)]
    pub isolation: Option<IsolationMode>,

    /// Keep isolated workspaces after the run.
    #[arg(long)]
    pub no_cleanup: bool,

    /// Stop waiting at the first failing stage.
    #[arg(long, conflicts_with = "failure_policy")]
    pub fail_fast: bool,

    /// What to do when a stage fails: `collect` or `fail-fast`.
    #[arg(long, value_name = "POLICY", value_parser = FailurePolicy::from_str)]
    pub failure_policy: Option<FailurePolicy>,

    /// Skip reproducing into the primary workspace after an isolated run.
    #[arg(long)]
    pub no_consolidate: bool,

    /// Read the graph from a command printing a DOT digraph.
    #[arg(long, value_name = "CMD")]
    pub source_cmd: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum QueueCommand {
    /// Capture the current workspace and queue it as an experiment.
    Add {
        name: String,

        /// Stages to reproduce (with their ancestors). Default: all.
        targets: Vec<String>,

        #[arg(short, long)]
        force: bool,
    },

    /// Show queued (and rejected) experiments.
    List,

    /// Drop experiments from the queue.
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repro_flags_parse() {
        let args = CliArgs::try_parse_from([
            "stagehand",
            "-C",
            "/tmp/ws",
            "repro",
            "train",
            "-f",
            "--workers",
            "3",
            "--isolate",
            "--fail-fast",
        ])
        .unwrap();

        assert_eq!(args.dir, Some(PathBuf::from("/tmp/ws")));
        match args.command {
            Command::Repro(r) => {
                assert_eq!(r.targets, vec!["train"]);
                assert!(r.force && r.isolate && r.fail_fast);
                assert_eq!(r.workers, Some(3));
                assert!(!r.no_cleanup);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn policy_options_override_settings_by_name() {
        let args = CliArgs::try_parse_from([
            "stagehand",
            "repro",
            "--isolation",
            "per_stage",
            "--failure-policy",
            "Fail-Fast",
        ])
        .unwrap();
        match args.command {
            Command::Repro(r) => {
                assert_eq!(r.isolation, Some(IsolationMode::PerStage));
                assert_eq!(r.failure_policy, Some(FailurePolicy::FailFast));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(
            CliArgs::try_parse_from(["stagehand", "repro", "--isolation", "sometimes"]).is_err()
        );
        assert!(
            CliArgs::try_parse_from([
                "stagehand",
                "repro",
                "--fail-fast",
                "--failure-policy",
                "collect"
            ])
            .is_err()
        );
    }

    #[test]
    fn queue_remove_requires_a_name() {
        assert!(CliArgs::try_parse_from(["stagehand", "queue", "remove"]).is_err());
    }
}
