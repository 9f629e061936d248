use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, instrument};

use crate::errors::{Result, SandboxError};
use crate::path::ProjectRoot;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 512 * 1024;
const TRUNCATION_MARKER: &str = "\n... (output truncated)";

#[derive(Clone, Debug)]
pub struct RunConfig {
    root: ProjectRoot,
    timeout: Option<Duration>,
    max_output_bytes: usize,
}

impl RunConfig {
    /// `timeout` of `None` lets commands run until they exit on their own.
    pub fn new(
        root: ProjectRoot,
        timeout: Option<Duration>,
        max_output_bytes: usize,
    ) -> Result<Self> {
        if max_output_bytes == 0 {
            return Err(SandboxError::InvalidArguments(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(SandboxError::InvalidArguments(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            root,
            timeout,
            max_output_bytes,
        })
    }

    pub fn root(&self) -> &ProjectRoot {
        &self.root
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

/// Runs shell commands with the project root as working directory.
///
/// There is no allow-list: whoever can call [`SandboxRun::run_test`] can run
/// any command the service user can, inside the root.
#[derive(Clone, Debug)]
pub struct SandboxRun {
    config: RunConfig,
}

impl SandboxRun {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs `command` and renders both streams; the exit code is not part of the payload.
    pub async fn run_test(&self, command: &str) -> Result<String> {
        let output = self.execute(command).await?;
        Ok(output.render())
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, command: &str) -> Result<RunOutput> {
        let root = self.config.root.path()?;
        if command.trim().is_empty() {
            return Err(SandboxError::InvalidArguments(
                "command must not be empty".to_string(),
            ));
        }

        let mut cmd = shell(command);
        cmd.current_dir(root)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .map_err(|err| SandboxError::Execution(err.to_string()))?;

        let start = Instant::now();
        let output = match self.config.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => return Err(SandboxError::Timeout(limit)),
            },
            None => child.wait_with_output().await,
        }
        .map_err(|err| SandboxError::Execution(err.to_string()))?;
        let duration = start.elapsed();

        let exit_code = output.status.code();
        info!(?exit_code, ?duration, "command finished");

        Ok(RunOutput {
            exit_code,
            stdout: truncate_lossy(&output.stdout, self.config.max_output_bytes),
            stderr: truncate_lossy(&output.stderr, self.config.max_output_bytes),
            duration,
        })
    }
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[derive(Debug)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutput {
    pub fn render(&self) -> String {
        format!("STDOUT:\n{}\nSTDERR:\n{}", self.stdout, self.stderr)
    }
}

fn truncate_lossy(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo".as_bytes();
        let out = truncate_lossy(text, 2);
        assert_eq!(out, format!("h{TRUNCATION_MARKER}"));
        assert_eq!(truncate_lossy(b"short", 64), "short");
    }

    #[test]
    fn render_labels_both_streams() {
        let output = RunOutput {
            exit_code: Some(1),
            stdout: "ok\n".to_string(),
            stderr: "warn\n".to_string(),
            duration: Duration::from_millis(3),
        };
        assert_eq!(output.render(), "STDOUT:\nok\n\nSTDERR:\nwarn\n");
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(RunConfig::new(ProjectRoot::unset(), Some(Duration::ZERO), 1024).is_err());
        assert!(RunConfig::new(ProjectRoot::unset(), None, 0).is_err());
    }
}
