//! Stdio transport for MCP child-process servers
//!
//! This module implements [`StdioTransport`], which spawns a child process
//! and communicates with it over its stdin/stdout pipes using
//! newline-delimited JSON framing. This is the standard transport for
//! locally-installed MCP servers.
//!
//! # Protocol
//!
//! - Outbound messages are queued on an unbounded channel and written to the
//!   child's stdin by a background writer task, one JSON object followed by
//!   a newline (`\n`). `send` never waits on the pipe.
//! - Inbound messages are read from the child's stdout as raw bytes, one
//!   JSON object per line. Blank lines are skipped; a line that is not UTF-8
//!   or not JSON is reported as one malformed frame.
//! - The child's stderr is drained on a background task and logged via
//!   `tracing::debug!`. It is diagnostic only and never treated as an error.
//!
//! # Lifecycle
//!
//! [`Transport::close`] closes stdin (aborting the writer if it is stuck on
//! a full pipe), gives the stderr drain a moment to finish, then waits up to
//! the configured grace period for the child to exit before killing it. When the transport is dropped without being
//! closed, a best-effort SIGTERM (Unix) or `start_kill` (non-Unix) is sent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::mcp::transport::{decode_frame, EnvPolicy, Transport};
use crate::mcp::types::JsonRpcMessage;

/// Capacity of the stdout line buffer.
const STDOUT_BUFFER_BYTES: usize = 1 << 20;

/// How long `close` waits for the stderr drain before moving on.
const STDERR_DRAIN_WAIT: Duration = Duration::from_secs(1);

/// How long `close` lets the writer flush queued lines before aborting it.
const WRITER_FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Default time a child gets to exit after stdin closes.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to launch one stdio server.
///
/// # Examples
///
/// ```
/// use mcpbridge::mcp::transport::StdioServerParams;
///
/// let params = StdioServerParams::new("fs", "npx")
///     .with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]);
/// assert_eq!(params.args.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct StdioServerParams {
    /// Server name, used in logs and errors.
    pub name: String,
    /// Executable to run.
    pub command: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Per-server environment overrides (expanded against the parent).
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Which parent variables the child may inherit.
    pub env_policy: EnvPolicy,
    /// Time allowed for a clean exit during `close`.
    pub close_grace: Duration,
}

impl StdioServerParams {
    /// Parameters with no arguments, no overrides and the default policy.
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            env_policy: EnvPolicy::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }

    /// Set the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the environment overrides.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the environment policy.
    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }

    /// Replace the close grace period.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use mcpbridge::mcp::transport::{StdioServerParams, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::spawn(
///     StdioServerParams::new("fs", "npx")
///         .with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    name: String,
    /// Queue feeding the writer task; `None` once `close` has dropped it.
    stdin_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    stdout: Mutex<StdoutReader>,
    /// Taken by `close`; `Drop` only signals what is still here.
    child: parking_lot::Mutex<Option<Child>>,
    writer_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stderr_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    close_grace: Duration,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn a child process and wire up stdio pipes.
    ///
    /// The child's environment is cleared and rebuilt from
    /// `params.env_policy` and `params.env`. A background task starts
    /// draining stderr immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::McpTransport`] if the process cannot be
    /// spawned or if the stdio pipes are unavailable.
    pub fn spawn(params: StdioServerParams) -> Result<Self> {
        let env = params.env_policy.build_from_process(&params.env);

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env_clear().envs(&env);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::McpTransport(format!(
                "failed to spawn MCP server `{}` ({}): {}",
                params.name,
                params.command.display(),
                e
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::McpTransport("child stdin unavailable after spawn".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::McpTransport("child stdout unavailable after spawn".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            BridgeError::McpTransport("child stderr unavailable after spawn".into())
        })?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(params.name.clone(), stdin, stdin_rx));

        let server = params.name.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "mcpbridge::mcp::transport::stdio",
                    server = %server,
                    "mcp server stderr: {}",
                    line
                );
            }
        });

        tracing::debug!(
            server = %params.name,
            pid = ?child.id(),
            command = %params.command.display(),
            "spawned MCP server"
        );

        Ok(Self {
            name: params.name,
            stdin_tx: parking_lot::Mutex::new(Some(stdin_tx)),
            stdout: Mutex::new(StdoutReader::new(stdout)),
            child: parking_lot::Mutex::new(Some(child)),
            writer_task: parking_lot::Mutex::new(Some(writer_task)),
            stderr_task: parking_lot::Mutex::new(Some(stderr_task)),
            close_grace: params.close_grace,
            closed: AtomicBool::new(false),
        })
    }

    /// OS process id of the child, while it is still owned by the transport.
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    fn take_child(&self) -> Option<Child> {
        self.child.lock().take()
    }

    fn take_stderr_task(&self) -> Option<JoinHandle<()>> {
        self.stderr_task.lock().take()
    }

    fn take_writer_task(&self) -> Option<JoinHandle<()>> {
        self.writer_task.lock().take()
    }
}

/// Writer task: drains the outbound queue into the child's stdin.
///
/// Exits when the queue is closed or a write fails; dropping `stdin` closes
/// the pipe.
async fn write_lines(
    server: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(server = %server, error = %e, "failed to write to MCP server stdin");
            break;
        }
    }
}

/// Buffered stdout plus the bytes of a line that is still being read.
///
/// Keeping the partial line here makes `receive` safe to cancel between
/// reads.
#[derive(Debug)]
struct StdoutReader {
    reader: BufReader<ChildStdout>,
    line: Vec<u8>,
}

impl StdoutReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            reader: BufReader::with_capacity(STDOUT_BUFFER_BYTES, stdout),
            line: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    /// Queue one line for the writer task. Never waits on the pipe.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::McpClosed`] after `close`, or once the writer
    /// has stopped because the child's stdin broke.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let tx = self.stdin_tx.lock().clone().ok_or_else(|| {
            BridgeError::McpClosed(format!("stdin of MCP server `{}` is closed", self.name))
        })?;
        tx.send(line).map_err(|_| {
            BridgeError::McpClosed(format!(
                "writer for MCP server `{}` has stopped",
                self.name
            ))
            .into()
        })
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
        let mut stdout = self.stdout.lock().await;
        let StdoutReader { reader, line } = &mut *stdout;
        loop {
            let read = match reader.read_until(b'\n', line).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(server = %self.name, error = %e, "stdout read failed; treating as end of stream");
                    return Ok(None);
                }
            };
            if read == 0 && line.is_empty() {
                return Ok(None);
            }

            let frame = std::mem::take(line);
            let Ok(text) = std::str::from_utf8(&frame) else {
                return Err(BridgeError::McpTransport(format!(
                    "malformed frame from MCP server `{}`: line is not valid UTF-8",
                    self.name
                ))
                .into());
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return decode_frame(&self.name, trimmed).map(Some);
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Closing stdin is the polite shutdown request for stdio servers.
        // Dropping the queue lets the writer finish; a writer blocked on a
        // full pipe is aborted, which drops stdin all the same.
        self.stdin_tx.lock().take();
        if let Some(mut task) = self.take_writer_task() {
            if tokio::time::timeout(WRITER_FLUSH_WAIT, &mut task)
                .await
                .is_err()
            {
                tracing::debug!(server = %self.name, "stdin writer still blocked; aborting");
                task.abort();
            }
        }

        if let Some(mut task) = self.take_stderr_task() {
            if tokio::time::timeout(STDERR_DRAIN_WAIT, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let Some(mut child) = self.take_child() else {
            return Ok(());
        };

        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "MCP server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "failed to wait for MCP server");
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.name,
                    grace_ms = self.close_grace.as_millis() as u64,
                    "MCP server did not exit within grace period; killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.name, error = %e, "failed to kill MCP server");
                }
            }
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    /// Best-effort termination of a child that was never closed.
    ///
    /// On Unix, sends SIGTERM to the child PID via `libc::kill`. On
    /// non-Unix platforms, calls `start_kill()` on the child handle. Never
    /// blocks.
    fn drop(&mut self) {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return;
        };
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }
}
