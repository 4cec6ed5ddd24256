use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Outcome of one external command.
#[derive(Debug)]
pub enum ProcessResult {
    Success {
        output_lines: Vec<String>,
    },
    Failure {
        output_lines: Vec<String>,
        /// `None` when the process could not be started or was killed by a signal.
        exit_code: Option<i32>,
        cause: anyhow::Error,
    },
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessResult::Success { .. })
    }

    pub fn output_lines(&self) -> &[String] {
        match self {
            ProcessResult::Success { output_lines } | ProcessResult::Failure { output_lines, .. } => {
                output_lines
            }
        }
    }
}

/// Runs `command_line` in `working_dir` with `env` merged over the ambient
/// environment. Stdout and stderr are merged line by line as they arrive and logged.
///
/// There is no timeout here; callers wrap the future when they need one.
#[instrument(skip(env), fields(dir = %working_dir.display()))]
pub async fn run(
    command_line: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> ProcessResult {
    match spawn_and_wait(command_line, working_dir, env).await {
        Ok((lines, status)) => {
            if status.success() {
                ProcessResult::Success { output_lines: lines }
            } else {
                let exit_code = status.code();
                let cause = match exit_code {
                    Some(code) => anyhow!("`{command_line}` exited with code {code}"),
                    None => anyhow!("`{command_line}` was terminated by a signal"),
                };
                ProcessResult::Failure {
                    output_lines: lines,
                    exit_code,
                    cause,
                }
            }
        }
        Err(cause) => ProcessResult::Failure {
            output_lines: vec![],
            exit_code: None,
            cause,
        },
    }
}

async fn spawn_and_wait(
    command_line: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> anyhow::Result<(Vec<String>, std::process::ExitStatus)> {
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("empty command line");
    };

    let mut child = Command::new(program)
        .args(parts)
        .current_dir(working_dir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start `{command_line}`"))?;

    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;

    let lines = merge_lines(stdout, stderr).await?;
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for `{command_line}`"))?;
    Ok((lines, status))
}

/// Reads both streams line by line into one buffer in the order lines arrive.
async fn merge_lines<O, E>(stdout: O, stderr: E) -> anyhow::Result<Vec<String>>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);
    let mut collected = Vec::new();

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line.context("failed to read stdout")? {
                Some(line) => record(&mut collected, line),
                None => out_open = false,
            },
            line = err.next_line(), if err_open => match line.context("failed to read stderr")? {
                Some(line) => record(&mut collected, line),
                None => err_open = false,
            },
        }
    }
    Ok(collected)
}

fn record(collected: &mut Vec<String>, line: String) {
    debug!(target: "sbomflow::process::output", "{line}");
    collected.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn successful_command_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("echo hello world", dir.path(), &no_env()).await;
        assert!(result.is_success());
        assert_eq!(result.output_lines(), ["hello world"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure_with_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fail.sh"), "echo before\nexit 3\n").unwrap();

        let result = run("sh fail.sh", dir.path(), &no_env()).await;
        match result {
            ProcessResult::Failure {
                output_lines,
                exit_code,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(output_lines, vec!["before"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_has_no_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("definitely-not-a-real-binary-sbomflow", dir.path(), &no_env()).await;
        match result {
            ProcessResult::Failure { exit_code, cause, .. } => {
                assert_eq!(exit_code, None);
                assert!(cause.to_string().contains("failed to start"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_command_line_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = run("   ", dir.path(), &no_env()).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn environment_is_passed_to_child() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("env.sh"), "echo \"$SBOMFLOW_TEST_VALUE\"\n").unwrap();
        let env = HashMap::from([("SBOMFLOW_TEST_VALUE".to_string(), "42".to_string())]);

        let result = run("sh env.sh", dir.path(), &env).await;
        assert_eq!(result.output_lines(), ["42"]);
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("err.sh"), "echo oops >&2\n").unwrap();

        let result = run("sh err.sh", dir.path(), &no_env()).await;
        assert!(result.is_success());
        assert_eq!(result.output_lines(), ["oops"]);
    }

    #[tokio::test]
    async fn output_streams_are_merged_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mixed.sh"),
            "echo one\nsleep 0.2\necho two >&2\nsleep 0.2\necho three\n",
        )
        .unwrap();

        let result = run("sh mixed.sh", dir.path(), &no_env()).await;
        assert_eq!(result.output_lines(), ["one", "two", "three"]);
    }
}
