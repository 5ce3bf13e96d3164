//! Capture helper process supervision
//!
//! At most one helper runs per capture machine. The helper is torn down on
//! stop and on playback pause, and spawned fresh on resume.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Buffered helper lines before backpressure applies
const LINE_BUFFER: usize = 256;

/// Something that can start a capture helper
pub trait CaptureSource: Send + Sync {
    /// Start a fresh helper instance
    ///
    /// # Errors
    ///
    /// Returns error if the helper cannot be started
    fn spawn(&self) -> Result<HelperProcess>;
}

/// A running helper: its stdout lines plus a kill switch
///
/// The line channel closes when the helper exits. Dropping the handle
/// kills the helper.
#[derive(Debug)]
pub struct HelperProcess {
    lines: mpsc::Receiver<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl HelperProcess {
    /// Wrap a line stream and a kill switch
    #[must_use]
    pub const fn new(lines: mpsc::Receiver<String>, kill: oneshot::Sender<()>) -> Self {
        Self {
            lines,
            kill: Some(kill),
        }
    }

    /// Wrap a line stream that has no process behind it
    #[must_use]
    pub const fn detached(lines: mpsc::Receiver<String>) -> Self {
        Self { lines, kill: None }
    }

    /// Next line of output, or `None` once the helper has exited
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Terminate the helper
    pub fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Spawns the configured capture helper binary
#[derive(Debug, Clone)]
pub struct ProcessCaptureSource {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessCaptureSource {
    /// Resolve the helper binary on `PATH`
    ///
    /// # Errors
    ///
    /// Returns error if the binary cannot be found
    pub fn new(program: &str, args: Vec<String>) -> Result<Self> {
        let program = which::which(program)
            .map_err(|e| Error::Capture(format!("capture helper {program} not found: {e}")))?;
        Ok(Self { program, args })
    }

    /// Path of the resolved helper binary
    #[must_use]
    pub const fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl CaptureSource for ProcessCaptureSource {
    fn spawn(&self) -> Result<HelperProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to spawn capture helper: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Capture("capture helper has no stdout".to_string()))?;
        let stderr = child.stderr.take();

        tracing::info!(
            program = %self.program.display(),
            pid = child.id().unwrap_or_default(),
            "capture helper started"
        );

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, stdout, stderr, line_tx, kill_rx));

        Ok(HelperProcess::new(line_rx, kill_tx))
    }
}

/// Forward helper stdout until it exits or is told to die
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    lines_tx: mpsc::Sender<String>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "capture helper stderr");
            }
        });
    }

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = &mut kill_rx => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill capture helper");
                }
                tracing::debug!("capture helper stopped");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if lines_tx.send(line).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "capture helper stdout read failed");
                    break;
                }
            },
        }
    }

    match child.wait().await {
        Ok(status) => tracing::info!(%status, "capture helper exited"),
        Err(e) => tracing::warn!(error = %e, "capture helper wait failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_helper_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut helper = HelperProcess::detached(rx);

        tx.send("HEARTBEAT".to_string()).await.unwrap();
        drop(tx);

        assert_eq!(helper.next_line().await.as_deref(), Some("HEARTBEAT"));
        assert_eq!(helper.next_line().await, None);
    }

    #[test]
    fn missing_helper_binary_is_a_capture_error() {
        let err = ProcessCaptureSource::new("parley-no-such-helper-binary", vec![]).unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_helper_forwards_stdout_lines() {
        let source = ProcessCaptureSource::new(
            "sh",
            vec!["-c".to_string(), "echo LEVEL:10; echo HEARTBEAT".to_string()],
        )
        .unwrap();

        let mut helper = source.spawn().unwrap();
        assert_eq!(helper.next_line().await.as_deref(), Some("LEVEL:10"));
        assert_eq!(helper.next_line().await.as_deref(), Some("HEARTBEAT"));
        assert_eq!(helper.next_line().await, None);
    }
}
