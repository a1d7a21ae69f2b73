//! Stdio transport
//!
//! Spawns an MCP server as a child process and exchanges newline-delimited
//! JSON-RPC messages over its stdin/stdout. Stderr is streamed into the
//! server log.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use metamcp_shared::{LogLevel, ServerLogEvent, StderrMode};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::executable::resolve_command;
use super::{Inbox, Transport, TransportKind, INBOUND_BUFFER};
use crate::logs::ServerLogStore;
use crate::mcp::error::{StderrStreamError, TransportError, TransportResult};

/// Everything needed to start one server process
#[derive(Debug, Clone)]
pub struct StdioLaunch {
    pub server_name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Fully merged environment; the child inherits nothing else
    pub env: BTreeMap<String, String>,
    pub stderr: StderrMode,
    pub spawn_timeout: Duration,
    pub close_grace: Duration,
}

/// Transport over a child process's stdio pipes
pub struct StdioTransport {
    command: String,
    pid: Option<u32>,
    outbound: mpsc::Sender<Value>,
    inbox: Inbox,
    closed: CancellationToken,
    child: Mutex<Option<Child>>,
    close_grace: Duration,
}

impl StdioTransport {
    /// Spawn the process and start the pipe tasks
    pub async fn spawn(launch: StdioLaunch, logs: ServerLogStore) -> TransportResult<Self> {
        let resolved = resolve_command(&launch.command, launch.args.clone(), &launch.env);

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&resolved.args)
            .env_clear()
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match launch.stderr {
                StderrMode::Pipe => Stdio::piped(),
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Ignore => Stdio::null(),
            })
            .kill_on_drop(true);

        let spawned = tokio::time::timeout(
            launch.spawn_timeout,
            tokio::task::spawn_blocking(move || cmd.spawn()),
        )
        .await;

        let mut child = match spawned {
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: "spawning process",
                    after: launch.spawn_timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionSetup(format!(
                    "spawn task for '{}' failed: {}",
                    launch.command, e
                )))
            }
            Ok(Ok(Err(e))) => {
                return Err(TransportError::ConnectionSetup(format!(
                    "failed to spawn '{}': {}",
                    launch.command, e
                )))
            }
            Ok(Ok(Ok(child))) => child,
        };

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionSetup("failed to capture stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionSetup("failed to capture stdout".to_string())
        })?;

        let closed = CancellationToken::new();
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(
                stderr,
                launch.server_name.clone(),
                launch.command.clone(),
                logs,
                closed.clone(),
            );
        }

        let pid = child.id();
        let (outbound, inbox) = spawn_line_io(launch.command.clone(), stdout, stdin, closed.clone());

        tracing::info!(
            server = %launch.server_name,
            command = %resolved.program.display(),
            args = ?resolved.args,
            pid = ?pid,
            "Spawned stdio MCP server"
        );

        Ok(Self {
            command: launch.command,
            pid,
            outbound,
            inbox,
            closed,
            child: Mutex::new(Some(child)),
            close_grace: launch.close_grace,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Value) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Close stdin, give the process the grace period to exit, then kill and reap
    async fn close(&self) {
        let child = self.child.lock().await.take();
        self.closed.cancel();

        let Some(mut child) = child else {
            return;
        };

        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.command, pid = ?self.pid, %status, "Process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %self.command, error = %e, "Error waiting for process");
            }
            Err(_) => {
                tracing::warn!(command = %self.command, pid = ?self.pid, "Killing unresponsive process");
                if let Err(e) = child.kill().await {
                    tracing::error!(command = %self.command, error = %e, "Failed to kill process");
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Transport over this process's own stdin/stdout, used by the `aggregate`
/// subcommand to serve a namespace to its parent.
pub struct ProcessStdioTransport {
    outbound: mpsc::Sender<Value>,
    inbox: Inbox,
    closed: CancellationToken,
}

impl ProcessStdioTransport {
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        let (outbound, inbox) = spawn_line_io(
            "stdio".to_string(),
            tokio::io::stdin(),
            tokio::io::stdout(),
            closed.clone(),
        );
        Self {
            outbound,
            inbox,
            closed,
        }
    }
}

impl Default for ProcessStdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ProcessStdioTransport {
    async fn send(&self, message: Value) -> TransportResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Value> {
        self.inbox.recv().await
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Start reader and writer tasks for newline-delimited JSON over a byte pipe.
///
/// End of input or a write failure cancels `closed`; cancelling `closed`
/// stops both tasks and shuts the writer down.
pub(crate) fn spawn_line_io<R, W>(
    label: String,
    reader: R,
    writer: W,
    closed: CancellationToken,
) -> (mpsc::Sender<Value>, Inbox)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(INBOUND_BUFFER);
    let (in_tx, inbox) = Inbox::new(closed.clone());

    let writer_closed = closed.clone();
    let writer_label = label.clone();
    tokio::spawn(async move {
        let mut writer = writer;
        loop {
            let message = tokio::select! {
                message = out_rx.recv() => message,
                _ = writer_closed.cancelled() => None,
            };
            let Some(message) = message else {
                break;
            };

            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(transport = %writer_label, error = %e, "Dropping unserializable message");
                    continue;
                }
            };
            line.push('\n');

            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(transport = %writer_label, error = %e, "Write failed");
                writer_closed.cancel();
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(transport = %writer_label, error = %e, "Failed to close stdin");
        }
        tracing::debug!(transport = %writer_label, "writer task exiting");
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = closed.cancelled() => break,
            };

            match next {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(message) => {
                            let delivered = tokio::select! {
                                result = in_tx.send(message) => result.is_ok(),
                                _ = closed.cancelled() => false,
                            };
                            if !delivered {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(transport = %label, error = %e, "Discarding non-JSON line");
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(transport = %label, "stdout stream closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(transport = %label, error = %e, "Failed to read stdout");
                    break;
                }
            }
        }
        closed.cancel();
    });

    (out_tx, inbox)
}

fn forward_stderr(
    stderr: ChildStderr,
    server_name: String,
    command: String,
    logs: ServerLogStore,
    closed: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(stderr).lines());
        loop {
            let next = tokio::select! {
                next = lines.next() => next,
                _ = closed.cancelled() => break,
            };

            match next {
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    logs.record(ServerLogEvent::new(
                        server_name.as_str(),
                        stderr_level(trimmed),
                        format!("[{}] {}", command, trimmed),
                    ));
                }
                Some(Err(source)) => {
                    let error = StderrStreamError {
                        command: command.clone(),
                        source,
                    };
                    tracing::warn!(server = %server_name, error = %error, "Failed to read stderr");
                    break;
                }
                None => break,
            }
        }
        tracing::debug!(server = %server_name, "stderr reader task exiting");
    });
}

fn stderr_level(line: &str) -> LogLevel {
    if line.contains("ERROR") || line.contains("FATAL") {
        LogLevel::Error
    } else if line.contains("WARN") {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}
