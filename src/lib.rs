// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod queue;
pub mod store;
pub mod types;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, QueueCommand, ReproArgs};
use crate::config::load_settings;
use crate::dag::{DotCommandSource, GraphSource, ManifestSource, load_graph};
use crate::engine::{ReproOptions, reproduce};
use crate::exec::{RetryPolicy, ShellRunner, offload, run_locked};
use crate::queue::{
    ExperimentHistory, ExperimentQueue, QueueRunner, enqueue_experiment, remove_experiment,
};
use crate::store::{MetadataStore, Repository};
use crate::types::{ClonerKind, FailurePolicy, IsolationMode, QueueMode};
use crate::workspace::{cloner_for, manager::redirect_cache};

/// High-level entry point used by `main.rs`.
///
/// Resolves the workspace root (`-C DIR` or the current directory) and
/// dispatches the subcommand.
pub async fn run(args: CliArgs) -> Result<()> {
    let root = match &args.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    debug!(root = ?root, command = ?args.command, "starting");

    match args.command {
        Command::Init => {
            let repo = Repository::init(&root)?;
            println!("initialised {}", repo.meta_dir().display());
        }
        Command::Dag {
            targets,
            source_cmd,
        } => print_dag(&root, &targets, source_cmd)?,
        Command::Repro(repro) => run_repro(&root, repro).await?,
        Command::Queue(cmd) => run_queue_command(&root, cmd)?,
        Command::Run {
            names,
            sequential,
            no_cleanup,
            reject_failed,
        } => run_experiments(&root, &names, sequential, no_cleanup, reject_failed).await?,
        Command::Apply { name } => apply_experiment(&root, &name).await?,
        Command::Clone {
            source,
            target,
            git,
        } => clone_workspace(&source, &target, git).await?,
    }

    Ok(())
}

fn print_dag(root: &Path, targets: &[String], source_cmd: Option<String>) -> Result<()> {
    let source: Box<dyn GraphSource> = match source_cmd {
        Some(cmd) => Box::new(DotCommandSource::new(cmd)),
        None => Box::new(ManifestSource),
    };
    let graph = load_graph(source.as_ref(), Some(root), targets)?;

    for (name, preds) in graph.iterate_over_nodes()? {
        let kind = match graph.stage(&name).and_then(|s| s.command()) {
            Some(_) => "",
            None => " (data)",
        };
        match preds {
            None => println!("{name}{kind}"),
            Some(preds) => println!("{name}{kind} <- {}", preds.join(", ")),
        }
    }
    Ok(())
}

fn repro_options(root: &Path, args: ReproArgs) -> Result<ReproOptions> {
    let settings = load_settings(root)?;
    let mut options = ReproOptions::from_settings(&settings);

    options.targets = args.targets;
    options.force = args.force;
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be >= 1");
        }
        options.workers = workers;
    }
    if let Some(retries) = args.retries {
        if retries == 0 {
            bail!("--retries must be >= 1");
        }
        options.retry = RetryPolicy::new(retries, options.retry.max_jitter);
    }
    if let Some(isolation) = args.isolation {
        options.isolation = isolation;
    }
    if args.isolate {
        options.isolation = IsolationMode::PerStage;
    }
    if args.no_cleanup {
        options.cleanup = false;
    }
    if let Some(policy) = args.failure_policy {
        options.failure_policy = policy;
    }
    if args.fail_fast {
        options.failure_policy = FailurePolicy::FailFast;
    }
    if args.no_consolidate {
        options.consolidate = false;
    }
    if args.source_cmd.is_some() {
        options.source_cmd = args.source_cmd;
    }
    Ok(options)
}

async fn run_repro(root: &Path, args: ReproArgs) -> Result<()> {
    let options = repro_options(root, args)?;
    let summary = reproduce(root, &options, Arc::new(ShellRunner)).await?;
    print!("{summary}");

    if let Some((stage, err)) = summary.first_failure() {
        return Err(anyhow::Error::new(err.clone()).context(format!("stage '{stage}' failed")));
    }
    info!(consolidated = summary.consolidated, "reproduce finished");
    Ok(())
}

fn run_queue_command(root: &Path, cmd: QueueCommand) -> Result<()> {
    match cmd {
        QueueCommand::Add {
            name,
            targets,
            force,
        } => {
            let settings = load_settings(root)?;
            let entry = enqueue_experiment(root, &name, targets, force, settings.queue.cloner)?;
            println!("queued {} at {}", entry.name, entry.revision);
        }
        QueueCommand::List => {
            let queue = ExperimentQueue::new(root);
            for entry in queue.list()? {
                println!("{}\t{}\tqueued", entry.name, entry.revision);
            }
            for entry in queue.rejected()? {
                println!("{}\t{}\trejected", entry.name, entry.revision);
            }
        }
        QueueCommand::Remove { names } => {
            let settings = load_settings(root)?;
            for name in names {
                remove_experiment(root, &name, settings.queue.cloner)?;
                println!("removed {name}");
            }
        }
    }
    Ok(())
}

async fn run_experiments(
    root: &Path,
    names: &[String],
    sequential: bool,
    no_cleanup: bool,
    reject_failed: bool,
) -> Result<()> {
    let settings = load_settings(root)?;
    let options = ReproOptions::from_settings(&settings);
    let mode = if sequential {
        QueueMode::Sequential
    } else {
        settings.queue.mode
    };

    let runner = QueueRunner::new(root, options.clone(), Arc::new(ShellRunner))
        .with_mode(mode)
        .with_cleanup(options.cleanup && !no_cleanup)
        .with_reject_failed(reject_failed || settings.queue.reject_failed);
    let runs = runner.run(names).await?;

    for run in runs.iter() {
        match &run.error {
            None => println!("{}: {:?}", run.name, run.state),
            Some(err) => println!("{}: {:?} ({err})", run.name, run.state),
        }
    }

    if let Some(err) = queue::first_failure(&runs) {
        return Err(err.into());
    }
    Ok(())
}

async fn apply_experiment(root: &Path, name: &str) -> Result<()> {
    let settings = load_settings(root)?;
    let policy = RetryPolicy::from_settings(&settings.exec);
    let repo = Repository::open(root)?;
    let history = ExperimentHistory::new(root);

    let stages = run_locked(&policy, "apply", || repo.is_locked(), || {
        let (repo, history, name) = (repo.clone(), history.clone(), name.to_string());
        offload("apply", move || history.apply(&repo, &name))
    })
    .await?;
    println!("applied {name}: {}", stages.join(", "));
    Ok(())
}

async fn clone_workspace(source: &Path, target: &Path, git: bool) -> Result<()> {
    let kind = if git { ClonerKind::Git } else { ClonerKind::Copy };
    let cloner = cloner_for(kind);
    let source: PathBuf = std::path::absolute(source)?;
    let target: PathBuf = std::path::absolute(target)?;

    let (src, dst) = (source.clone(), target.clone());
    tokio::task::spawn_blocking(move || -> crate::errors::Result<()> {
        cloner.as_ref().clone_into(&src, &dst)?;
        redirect_cache(&src, &dst)
    })
    .await??;

    println!("cloned {} -> {}", source.display(), target.display());
    Ok(())
}
