//! Local subprocess execution.
//!
//! [`ProcessRunner`] spawns a program with piped stdio, captures stdout and
//! stderr in background tasks and enforces a timeout. Everything that touches
//! the local container engine goes through the [`CommandRunner`] trait so the
//! backends can be driven by a scripted runner in tests.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use neuroinsight_remote::CommandOutput;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::ExecutionError;

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// `docker logs` of a long recon run can be large; the excess is dropped.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion. A non-zero exit is not an
    /// error; the caller inspects [`CommandOutput::exit_code`].
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

        // On timeout `child` is dropped and killed.
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                tracing::debug!(
                    program,
                    exit_code = status.code(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Command finished"
                );
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Ok(Err(e)) => Err(ExecutionError::Io(e)),
            Err(_elapsed) => Err(ExecutionError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("`{program}` timed out after {}s", timeout.as_secs()),
            ))),
        }
    }
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

/// `program arg arg ...` for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
