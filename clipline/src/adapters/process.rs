//! Subprocess execution with cancellation support.
//!
//! External tools are killed immediately when the run's cancellation token
//! fires; the in-flight item's partial output is the caller's to discard.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last few stderr lines, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        lines.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

/// Run a command to completion, capturing stdout/stderr.
///
/// Returns `Ok(None)` when the token fired: the child is killed and reaped
/// before returning, so no stray process outlives cancellation.
pub async fn run_with_cancel(
    mut command: Command,
    cancel: &CancellationToken,
) -> std::io::Result<Option<CommandOutput>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?command.as_std(), "spawning subprocess");
    let mut child = command.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    // Drain both pipes concurrently with the wait so a chatty tool cannot
    // deadlock on a full pipe buffer.
    let stdout_task = tokio::spawn(read_stream(stdout));
    let stderr_task = tokio::spawn(read_stream(stderr));

    tokio::select! {
        _ = cancel.cancelled() => {
            warn!("cancellation requested, killing subprocess");
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            Ok(None)
        }
        status = child.wait() => {
            let status = status?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let code = status.code();
            if code != Some(0) {
                warn!(exit_code = ?code, "subprocess exited abnormally");
            }
            Ok(Some(CommandOutput {
                exit_code: code,
                stdout,
                stderr,
            }))
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = stream.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
}
