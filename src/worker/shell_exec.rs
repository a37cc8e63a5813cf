use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::job::Job;
use crate::worker::executor::{ExecOutcome, TaskExecutor};

/// Hard deadline for one shell execution.
const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the job's command through a POSIX shell and captures its output.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, job: &Job) -> ExecOutcome {
        let command = &job.executor.command;
        tracing::info!(job_name = %job.name, command = %command, "executing shell command");

        let run = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(SHELL_TIMEOUT, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecOutcome::failure(
                    String::new(),
                    format!("failed to spawn shell command: {e}"),
                );
            }
            Err(_) => {
                return ExecOutcome::failure(
                    String::new(),
                    format!("shell command timed out after {}s", SHELL_TIMEOUT.as_secs()),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let combined = combine_output(&stdout, &stderr);

        if !output.status.success() {
            return ExecOutcome::failure(
                combined,
                format!("shell command failed: {}", output.status),
            );
        }

        tracing::info!(job_name = %job.name, "shell command executed successfully");
        ExecOutcome::success(combined)
    }
}

/// Stderr is prepended to stdout for visibility; stdout alone passes
/// through untouched.
fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        return stdout.to_string();
    }
    if stdout.is_empty() {
        return format!("[STDERR]:\n{stderr}");
    }
    format!("[STDERR]:\n{stderr}\n[STDOUT]:\n{stdout}")
}

#[cfg(test)]
mod tests {
    use super::combine_output;

    #[test]
    fn stdout_only_passes_through() {
        assert_eq!(combine_output("hi\n", ""), "hi\n");
    }

    #[test]
    fn stderr_only_is_tagged() {
        assert_eq!(combine_output("", "oops\n"), "[STDERR]:\noops\n");
    }

    #[test]
    fn both_streams_are_combined() {
        assert_eq!(
            combine_output("out\n", "err\n"),
            "[STDERR]:\nerr\n\n[STDOUT]:\nout\n"
        );
    }
}
