//! Outer dispatch loop: the gateway's own MCP server over stdio.
//!
//! Reads line-delimited JSON-RPC from the client, handles each request on
//! its own task, and pushes `notifications/tools/list_changed` whenever the
//! supervisor reports a catalog change.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;

use crate::gateway::types::{error_codes, JsonRpcError, JsonRpcMessage, PROTOCOL_VERSION};
use crate::gateway::{
    is_management_tool, management_tools, CallRouter, ManagementSurface, ToolDefinition,
    ToolResult, ToolsChanged, WorkerSupervisor,
};

type SharedWriter<W> = Arc<Mutex<W>>;

/// Front door: one client, many workers behind it.
pub struct GatewayServer {
    supervisor: Arc<WorkerSupervisor>,
    router: CallRouter,
    management: ManagementSurface,
}

impl GatewayServer {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Arc<Self> {
        let router = CallRouter::new(Arc::clone(&supervisor));
        let management = ManagementSurface::new(Arc::clone(&supervisor), router.clone());
        Arc::new(Self {
            supervisor,
            router,
            management,
        })
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Management tools followed by every active worker's namespaced tools.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = management_tools();
        tools.extend(self.supervisor.all_tools());
        tools
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>) -> ToolResult {
        if is_management_tool(name) {
            return self.management.handle(name, arguments).await;
        }
        self.router.route(name, arguments.unwrap_or_default()).await
    }

    /// Answer one JSON-RPC request.
    pub async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => {
                let protocol = params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION);
                Ok(json!({
                    "protocolVersion": protocol,
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "mcphub", "version": env!("CARGO_PKG_VERSION") },
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.list_tools() })),
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return Err(rpc_error(error_codes::INVALID_PARAMS, "missing tool name"));
                };
                let arguments = params.get("arguments").and_then(Value::as_object).cloned();
                let result = self.call_tool(name, arguments).await;
                serde_json::to_value(result)
                    .map_err(|e| rpc_error(error_codes::INTERNAL_ERROR, &e.to_string()))
            }
            other => Err(rpc_error(
                error_codes::METHOD_NOT_FOUND,
                &format!("Method not found: {other}"),
            )),
        }
    }

    /// Serve one client until its input ends.
    ///
    /// Auto-activation of flagged workers starts once the change
    /// subscription is in place, so their list_changed pushes are not lost.
    /// Request handlers are owned by this future: dropping it aborts them,
    /// so none can start a worker after the supervisor has shut down.
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let mut tasks = JoinSet::new();

        tasks.spawn(push_list_changed(
            self.supervisor.subscribe(),
            Arc::clone(&writer),
        ));

        let supervisor = Arc::clone(&self.supervisor);
        tasks.spawn(async move {
            for (name, result) in supervisor.auto_activate().await {
                if result.is_error {
                    tracing::warn!(worker = %name, "auto-activation failed: {}", result.text_content());
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(done) = tasks.join_next() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            tracing::error!(error = %e, "request handler panicked");
                        }
                    }
                    continue;
                }
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: JsonRpcMessage = match serde_json::from_str(line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "unparseable client message");
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": Value::Null,
                        "error": rpc_error(error_codes::PARSE_ERROR, "Parse error"),
                    });
                    write_message(&writer, &response).await?;
                    continue;
                }
            };

            let params = message.params;
            let (Some(method), Some(id)) = (message.method, message.id) else {
                // Notifications and stray responses need no reply.
                continue;
            };

            let server = Arc::clone(self);
            let writer = Arc::clone(&writer);
            tasks.spawn(async move {
                let response = match server.handle_request(&method, params).await {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
                };
                if let Err(e) = write_message(&writer, &response).await {
                    tracing::warn!(method = %method, error = %e, "failed to write response");
                }
            });
        }

        tracing::info!(pending = tasks.len(), "client input closed");
        tasks.shutdown().await;
        Ok(())
    }
}

async fn push_list_changed<W>(mut changes: broadcast::Receiver<ToolsChanged>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Send + Unpin,
{
    let notification = json!({
        "jsonrpc": "2.0",
        "method": "notifications/tools/list_changed",
    });
    loop {
        match changes.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                if write_message(&writer, &notification).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_message<W>(writer: &SharedWriter<W>, message: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = message.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn rpc_error(code: i32, message: &str) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.to_string(),
        data: None,
    }
}
