mod common;

use clap::Parser;
use stagehand::cli::CliArgs;
use stagehand::queue::{ExperimentHistory, ExperimentQueue};

use common::{PipelineBuilder, StageBuilder, init_tracing, with_timeout};

fn args(dir: &std::path::Path, rest: &[&str]) -> CliArgs {
    let mut argv = vec!["stagehand", "-C", dir.to_str().unwrap()];
    argv.extend_from_slice(rest);
    CliArgs::try_parse_from(argv).unwrap()
}

fn pipeline() -> PipelineBuilder {
    PipelineBuilder::new().with_stage(
        "shout",
        StageBuilder::new("tr a-z A-Z < msg.txt > shout.txt")
            .dep("msg.txt")
            .out("shout.txt")
            .build(),
    )
}

#[tokio::test]
async fn init_repro_queue_run_apply() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    stagehand::run(args(root, &["init"])).await.unwrap();
    assert!(root.join(".stagehand/config.toml").is_file());

    pipeline().write_to(root);
    std::fs::write(root.join("msg.txt"), "hi").unwrap();

    with_timeout(stagehand::run(args(root, &["repro", "--workers", "2"])))
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(root.join("shout.txt")).unwrap(), "HI");

    std::fs::write(root.join("msg.txt"), "queued").unwrap();
    stagehand::run(args(root, &["queue", "add", "exp"])).await.unwrap();
    assert_eq!(ExperimentQueue::new(root).list().unwrap().len(), 1);

    with_timeout(stagehand::run(args(root, &["run", "--sequential"])))
        .await
        .unwrap();
    assert!(ExperimentQueue::new(root).list().unwrap().is_empty());
    assert!(ExperimentHistory::new(root).get("exp").is_ok());
    assert_eq!(std::fs::read_to_string(root.join("shout.txt")).unwrap(), "HI");

    with_timeout(stagehand::run(args(root, &["apply", "exp"])))
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(root.join("shout.txt")).unwrap(), "QUEUED");
}

#[tokio::test]
async fn failing_repro_exits_with_the_stage_error() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    stagehand::run(args(root, &["init"])).await.unwrap();
    PipelineBuilder::new()
        .with_stage("bad", StageBuilder::new("exit 9").build())
        .write_to(root);

    let err = stagehand::run(args(root, &["repro"])).await.unwrap_err();
    assert!(format!("{err:#}").contains("exit code 9"), "{err:#}");
}

#[tokio::test]
async fn zero_workers_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let err = stagehand::run(args(dir.path(), &["repro", "--workers", "0"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("--workers"));
}

#[tokio::test]
async fn clone_shares_the_source_cache() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::create_dir_all(&src).unwrap();
    stagehand::run(args(&src, &["init"])).await.unwrap();
    std::fs::write(src.join("data.txt"), "x").unwrap();

    stagehand::run(args(
        &src,
        &["clone", src.to_str().unwrap(), dst.to_str().unwrap()],
    ))
    .await
    .unwrap();

    assert_eq!(std::fs::read_to_string(dst.join("data.txt")).unwrap(), "x");
    let a = stagehand::store::Repository::open(&src).unwrap();
    let b = stagehand::store::Repository::open(&dst).unwrap();
    assert_eq!(a.cache_dir(), b.cache_dir());
}
