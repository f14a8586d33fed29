// src/exec/runner.rs

//! Stage command runner.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::Result;

/// Environment variable prefix for stage params.
pub const PARAM_ENV_PREFIX: &str = "STAGEHAND_PARAM_";

/// Runs a stage's shell command and reports its exit code.
///
/// Production code uses [`ShellRunner`]; tests substitute runners that count
/// invocations or simulate failures without spawning processes.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run<'a>(
        &'a self,
        stage: &'a str,
        cmd: &'a str,
        cwd: &'a Path,
        params: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>>;
}

/// `sh -c <cmd>` in the workspace, output streamed into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run<'a>(
        &'a self,
        stage: &'a str,
        cmd: &'a str,
        cwd: &'a Path,
        params: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>> {
        Box::pin(run_shell(stage, cmd, cwd, params))
    }
}

/// `threshold` -> `STAGEHAND_PARAM_THRESHOLD`, `learning-rate` ->
/// `STAGEHAND_PARAM_LEARNING_RATE`.
pub fn param_env_name(key: &str) -> String {
    let suffix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{PARAM_ENV_PREFIX}{suffix}")
}

async fn run_shell(
    stage: &str,
    cmd: &str,
    cwd: &Path,
    params: &BTreeMap<String, String>,
) -> Result<i32> {
    info!(stage = %stage, cmd = %cmd, cwd = ?cwd, "starting stage command");

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .current_dir(cwd)
        .env("STAGEHAND_STAGE", stage)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in params.iter() {
        command.env(param_env_name(key), value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning process for stage '{}'", stage))?;

    let stdout_task = child.stdout.take().map(|stdout| {
        let stage = stage.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(stage = %stage, "stdout: {}", line);
            }
        })
    });

    let stderr_task = child.stderr.take().map(|stderr| {
        let stage = stage.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(stage = %stage, "stderr: {}", line);
            }
        })
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of stage '{}'", stage))?;

    // Drain remaining output so log lines precede the exit record.
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let _ = task.await;
    }

    let code = status.code().unwrap_or(-1);
    debug!(stage = %stage, exit_code = code, success = status.success(), "stage command exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names_are_upper_snake_case() {
        assert_eq!(param_env_name("threshold"), "STAGEHAND_PARAM_THRESHOLD");
        assert_eq!(param_env_name("learning-rate"), "STAGEHAND_PARAM_LEARNING_RATE");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_and_params_reach_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = BTreeMap::new();
        params.insert("epochs".to_string(), "3".to_string());

        let code = ShellRunner
            .run(
                "train",
                "test \"$STAGEHAND_PARAM_EPOCHS\" = 3 && echo ok > out.txt",
                dir.path(),
                &params,
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap().trim(),
            "ok"
        );

        let code = ShellRunner
            .run("fail", "exit 7", dir.path(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(code, 7);
    }
}
