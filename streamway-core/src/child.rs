//! Child process supervision.
//!
//! The gateway runs exactly one child for its whole lifetime. Handlers talk
//! to it through a cloneable writer backed by a channel; a single task owns
//! stdin and writes one newline-terminated JSON message at a time, so
//! concurrent requests can never interleave bytes. Stdout is framed into
//! lines and parsed here, stderr goes to the log, and an exit monitor
//! reports the child's exit code so the caller can take the process down.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Handle for enqueueing outbound messages to the child's stdin.
#[derive(Clone)]
pub struct ChildWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl ChildWriter {
    /// Serialize a message and queue it as one line. Ordering across callers
    /// follows the queue order.
    pub fn send(&self, message: &Value) -> Result<()> {
        let line = serde_json::to_string(message).context("Failed to serialize message")?;
        self.tx
            .send(line)
            .map_err(|_| anyhow!("Child stdin is closed"))
    }
}

pub struct ChildHandle {
    writer: ChildWriter,
    exit_rx: oneshot::Receiver<i32>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl ChildHandle {
    pub fn writer(&self) -> ChildWriter {
        self.writer.clone()
    }

    /// Resolves with the child's exit code (1 when killed by a signal).
    pub async fn wait(&mut self) -> i32 {
        (&mut self.exit_rx).await.unwrap_or(1)
    }

    /// Ask the exit monitor to kill the child. Used on gateway shutdown.
    pub fn shutdown(&self) {
        let _ = self.kill_tx.send(());
    }
}

/// Spawn the configured shell command with piped stdio and wire up the four
/// background tasks (stdin writer, stdout framer, stderr logger, exit
/// monitor). `on_line` is invoked once per complete JSON line of stdout, in
/// the order the child wrote them.
pub fn spawn_child(
    command: &str,
    on_line: impl Fn(Value) + Send + 'static,
) -> Result<ChildHandle> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn child process: {}", command))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("Failed to open child stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("Failed to open child stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("Failed to open child stderr"))?;

    debug!("Spawned child process: {}", command);

    // Stdin writer: one message, one newline, flushed, before the next.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut writer = stdin;
        while let Some(line) = stdin_rx.recv().await {
            let framed = format!("{}\n", line);
            if let Err(e) = writer.write_all(framed.as_bytes()).await {
                error!("Failed to write to child stdin: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush child stdin: {}", e);
                break;
            }
        }
        debug!("Child stdin writer ended");
    });

    // Stdout framer: complete lines only, junk is logged and skipped.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => on_line(message),
                Err(e) => error!("Discarding non-JSON line from child: {} ({})", trimmed, e),
            }
        }
        debug!("Child stdout closed");
    });

    // Stderr is the child's log channel; pass it through.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!("child stderr: {}", line);
        }
        debug!("Child stderr closed");
    });

    // Exit monitor: owns the child, waits for exit or a kill request.
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let code = match status {
                    Ok(status) => {
                        error!("Child process exited with {}", status);
                        status.code().unwrap_or(1)
                    }
                    Err(e) => {
                        error!("Failed to wait for child process: {}", e);
                        1
                    }
                };
                let _ = exit_tx.send(code);
            }
            _ = kill_rx.recv() => {
                if let Err(e) = child.kill().await {
                    error!("Failed to kill child process: {}", e);
                } else {
                    debug!("Child process stopped on shutdown");
                }
            }
        }
    });

    Ok(ChildHandle {
        writer: ChildWriter { tx: stdin_tx },
        exit_rx,
        kill_tx,
    })
}
