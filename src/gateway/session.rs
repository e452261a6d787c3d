//! Worker session: one live worker process and its protocol channel.
//!
//! Handles spawning, the MCP handshake, catalog discovery, tool calls,
//! liveness pings and teardown. Each worker runs as a separate OS process
//! communicating via JSON-RPC over stdio.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::resolve_env;
use super::errors::GatewayError;
use super::transport::StdioTransport;
use super::types::{ListToolsResult, ToolDefinition, ToolResult, WorkerConfig, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long `disconnect` waits for a graceful exit before killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Stderr lines retained for connection-failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on the stderr text appended to an error message.
const STDERR_TAIL_CHARS: usize = 2000;

/// How long a failed connect waits for the stderr forwarder to reach EOF.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Events ──────────────────────────────────────────────────────────────────

/// Out-of-band notification from a session to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel closed without `disconnect()` having been called.
    Closed { worker: String, generation: u64 },
}

// ─── WorkerSession ───────────────────────────────────────────────────────────

/// A running worker process with its transport and tool catalog.
pub struct WorkerSession {
    name: String,
    /// Distinguishes this session from earlier activations of the same worker.
    generation: u64,
    pid: Option<u32>,
    process: tokio::sync::Mutex<Child>,
    transport: StdioTransport,
    tools: Vec<ToolDefinition>,
    ping_timeout: Duration,
}

impl WorkerSession {
    /// Spawn the worker, perform the handshake and fetch its catalog.
    ///
    /// On success, an unexpected close later produces exactly one
    /// [`SessionEvent::Closed`] on `events`. On failure the spawned process
    /// is killed before returning.
    pub async fn connect(
        config: &WorkerConfig,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, GatewayError> {
        let name = config.name.as_str();
        let timeout = Duration::from_millis(config.timeout);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(resolve_env(&config.env));

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::ConnectionFailed {
            name: name.to_string(),
            reason: format!("failed to spawn '{}': {e}", config.command),
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::ConnectionFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::ConnectionFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail)))
        });

        tracing::debug!(worker = name, pid = ?pid, command = %config.command, "spawned worker process");

        let (transport, closed) = StdioTransport::start(name, stdin, stdout);

        let tools = match tokio::time::timeout(timeout, handshake(&transport, name)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                drain_stderr(stderr_task).await;
                let reason = format!("{e}{}", stderr_suffix(&stderr_tail));
                return Err(GatewayError::ConnectionFailed {
                    name: name.to_string(),
                    reason,
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                drain_stderr(stderr_task).await;
                let reason = format!(
                    "connection timed out after {}ms{}",
                    config.timeout,
                    stderr_suffix(&stderr_tail)
                );
                return Err(GatewayError::ConnectionFailed {
                    name: name.to_string(),
                    reason,
                });
            }
        };

        let worker = name.to_string();
        tokio::spawn(async move {
            if closed.await.is_ok() {
                let _ = events.send(SessionEvent::Closed { worker, generation });
            }
        });

        Ok(Self {
            name: name.to_string(),
            generation,
            pid,
            process: tokio::sync::Mutex::new(child),
            transport,
            tools,
            ping_timeout: timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The catalog fetched during `connect`.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Forward a tool call verbatim. No gateway deadline is applied.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolResult, GatewayError> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let result = match self.transport.request("tools/call", Some(params)).await {
            Ok(result) => result,
            Err(GatewayError::Transport { .. }) if self.transport.is_closed() => {
                return Err(GatewayError::Crashed {
                    name: self.name.clone(),
                    reason: format!("process exited during call to '{tool}'"),
                });
            }
            Err(e) => return Err(e),
        };
        serde_json::from_value(result).map_err(|e| GatewayError::Transport {
            name: self.name.clone(),
            reason: format!("malformed tools/call result: {e}"),
        })
    }

    /// Liveness check. Any failure, including a slow reply past the
    /// connection timeout, is reported as `false`.
    pub async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(self.ping_timeout, self.transport.request("ping", None)).await,
            Ok(Ok(_))
        )
    }

    /// Terminate the process and release the channel. Best-effort: errors
    /// are swallowed and the wait for exit is bounded.
    pub async fn disconnect(&self) {
        self.transport.close().await;

        let mut process = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(worker = %self.name, %status, "worker exited");
            }
            _ => {
                let _ = process.kill().await;
                tracing::debug!(worker = %self.name, "worker killed after shutdown timeout");
            }
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// `initialize` → `notifications/initialized` → `tools/list` (all pages).
async fn handshake(
    transport: &StdioTransport,
    worker: &str,
) -> Result<Vec<ToolDefinition>, GatewayError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": format!("mcphub->{worker}"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let init = transport.request("initialize", Some(params)).await?;
    tracing::debug!(
        worker,
        server = ?init.get("serverInfo"),
        protocol = ?init.get("protocolVersion"),
        "worker initialized"
    );

    transport.notify("notifications/initialized", None).await?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let page = transport.request("tools/list", params).await?;
        let page: ListToolsResult =
            serde_json::from_value(page).map_err(|e| GatewayError::ConnectionFailed {
                name: worker.to_string(),
                reason: format!("malformed tool catalog: {e}"),
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }

    Ok(tools)
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Log each stderr line under the worker's name and keep the latest few.
async fn forward_stderr(worker: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        tracing::info!(worker = %worker, "{line}");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Let the forwarder store whatever the dead process left in the pipe.
///
/// Stdout can hit EOF before the last stderr line has been read, so the
/// tail is only complete once the forwarder finishes.
async fn drain_stderr(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn stderr_suffix(tail: &Mutex<VecDeque<String>>) -> String {
    let tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
    if tail.is_empty() {
        return String::new();
    }
    let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    if text.len() > STDERR_TAIL_CHARS {
        let mut cut = text.len() - STDERR_TAIL_CHARS;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        text = format!("...{}", &text[cut..]);
    }
    format!(" | stderr: {text}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_suffix_empty() {
        let tail = Mutex::new(VecDeque::new());
        assert_eq!(stderr_suffix(&tail), "");
    }

    #[test]
    fn test_stderr_suffix_truncates_from_front() {
        let long = "x".repeat(STDERR_TAIL_CHARS + 100);
        let tail = Mutex::new(VecDeque::from(vec!["first".to_string(), long]));
        let suffix = stderr_suffix(&tail);
        assert!(suffix.starts_with(" | stderr: ..."));
        assert!(!suffix.contains("first"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WorkerConfig::new("ghost", "/nonexistent/mcphub-worker-binary", vec![]);
        let err = WorkerSession::connect(&config, 1, tx).await.err().unwrap();
        match err {
            GatewayError::ConnectionFailed { name, reason } => {
                assert_eq!(name, "ghost");
                assert!(reason.contains("failed to spawn"));
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = WorkerConfig::new(
            "broken",
            "/bin/sh",
            vec!["-c".into(), "echo 'missing API key' >&2; sleep 0.2; exit 3".into()],
        );
        let err = WorkerSession::connect(&config, 1, tx).await.err().unwrap();
        let text = err.to_string();
        assert!(text.contains("broken"), "{text}");
        assert!(text.contains("missing API key"), "{text}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_always_reports_stderr() {
        for attempt in 0..20 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let config = WorkerConfig::new(
                "broken",
                "/bin/sh",
                vec!["-c".into(), "echo 'missing API key' >&2; exit 3".into()],
            );
            let err = WorkerSession::connect(&config, 1, tx).await.err().unwrap();
            let text = err.to_string();
            assert!(
                text.contains("| stderr: missing API key"),
                "attempt {attempt}: {text}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = WorkerConfig::new("mute", "/bin/sh", vec!["-c".into(), "sleep 5".into()]);
        config.timeout = 200;
        let err = WorkerSession::connect(&config, 1, tx).await.err().unwrap();
        assert!(err.to_string().contains("timed out after 200ms"));
    }
}
