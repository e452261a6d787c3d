//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a worker process:
//! - Writing JSON-RPC requests and notifications to its stdin
//! - A background reader that matches responses on stdout to pending requests
//! - Line-delimited JSON protocol (one JSON object per line)
//! - A one-shot close signal when stdout ends without `close()` being called

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::GatewayError;
use super::types::{error_codes, JsonRpcMessage, JsonRpcRequest};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Requests waiting for a response. `open` flips to false exactly once, when
/// the reader stops; no waiter is inserted after that.
struct PendingTable {
    open: bool,
    waiters: HashMap<u64, oneshot::Sender<JsonRpcMessage>>,
}

struct Shared {
    worker: String,
    writer: Mutex<Option<BoxedWriter>>,
    pending: std::sync::Mutex<PendingTable>,
    closing: AtomicBool,
}

impl Shared {
    fn closed_error(&self) -> GatewayError {
        GatewayError::Transport {
            name: self.worker.clone(),
            reason: "worker stdout closed (process may have exited)".into(),
        }
    }

    async fn write_line(&self, message: &serde_json::Value) -> Result<(), GatewayError> {
        let mut json = serde_json::to_string(message).map_err(|e| GatewayError::Transport {
            name: self.worker.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| GatewayError::Transport {
            name: self.worker.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| GatewayError::Transport {
                name: self.worker.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| GatewayError::Transport {
            name: self.worker.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    async fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let message = match serde_json::from_str::<JsonRpcMessage>(trimmed) {
            Ok(m) => m,
            Err(_) => {
                // Not JSON-RPC; some servers print banners to stdout.
                tracing::debug!(worker = %self.worker, line = trimmed, "ignoring non-JSON-RPC output");
                return;
            }
        };

        if message.is_response() {
            let waiter = message.numeric_id().and_then(|id| {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .waiters
                    .remove(&id)
            });
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => {
                    tracing::debug!(worker = %self.worker, id = ?message.id, "response for unknown request id");
                }
            }
            return;
        }

        match (message.id, message.method) {
            (Some(id), Some(method)) => {
                // The gateway advertises no client capabilities, so any
                // server-initiated request is unsupported.
                tracing::debug!(worker = %self.worker, method = %method, "rejecting worker request");
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("method not supported by gateway: {method}"),
                    },
                });
                if let Err(e) = self.write_line(&reply).await {
                    tracing::debug!(worker = %self.worker, error = %e, "failed to reject worker request");
                }
            }
            (None, Some(method)) => {
                tracing::debug!(worker = %self.worker, method = %method, "worker notification");
            }
            _ => {}
        }
    }
}

/// Bi-directional JSON-RPC transport over a worker's stdio.
///
/// Many requests may be in flight at once; responses are matched by `id`.
pub struct StdioTransport {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Start a transport over the given pipes.
    ///
    /// The returned receiver resolves once if stdout ends while the transport
    /// was not being closed deliberately. After `close()` it never resolves.
    pub fn start<W, R>(worker: &str, writer: W, reader: R) -> (Self, oneshot::Receiver<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            worker: worker.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            pending: std::sync::Mutex::new(PendingTable {
                open: true,
                waiters: HashMap::new(),
            }),
            closing: AtomicBool::new(false),
        });

        let (closed_tx, closed_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), reader, closed_tx));

        (Self { shared, reader }, closed_rx)
    }

    /// Send a JSON-RPC request and wait for its result.
    ///
    /// There is no deadline here; callers that need one wrap the future.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let id = next_request_id();
        let request = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            GatewayError::Transport {
                name: self.shared.worker.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !table.open {
                return Err(self.shared.closed_error());
            }
            table.waiters.insert(id, tx);
        }

        if let Err(e) = self.shared.write_line(&request).await {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .waiters
                .remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| self.shared.closed_error())?;
        extract_result(response)
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.shared.write_line(&notification).await
    }

    /// Mark the close as intentional and shut the worker's stdin.
    ///
    /// Suppresses the close signal. Errors are ignored.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether the reader has stopped (stdout ended or failed).
    pub fn is_closed(&self) -> bool {
        !self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.reader.abort();
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, closed_tx: oneshot::Sender<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => shared.dispatch_line(&String::from_utf8_lossy(&buf)).await,
            Err(e) => {
                tracing::warn!(worker = %shared.worker, error = %e, "failed to read worker stdout");
                break;
            }
        }
    }

    // Dropping the senders wakes every waiter with a closed error.
    let waiters = {
        let mut table = shared.pending.lock().unwrap_or_else(PoisonError::into_inner);
        table.open = false;
        std::mem::take(&mut table.waiters)
    };
    drop(waiters);

    if !shared.closing.load(Ordering::SeqCst) {
        let _ = closed_tx.send(());
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `GatewayError`.
///
/// A response with neither field is treated as a `null` result.
pub fn extract_result(response: JsonRpcMessage) -> Result<serde_json::Value, GatewayError> {
    if let Some(err) = response.error {
        return Err(GatewayError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(serde_json::Value::Null))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
