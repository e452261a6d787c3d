//! Shared types for the gateway.
//!
//! JSON-RPC 2.0 message types, MCP tool/result structures, worker
//! configuration and the per-worker runtime record.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::GatewayError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// MCP protocol revision spoken on both sides of the gateway.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request message sent to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Any line read from a JSON-RPC peer: response, request, or notification.
///
/// `id` stays a raw value because peers may use strings or numbers.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Whether this message answers a request rather than making one.
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// Numeric request id, when the peer used one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(serde_json::Value::as_u64)
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool descriptor as advertised by a worker's `tools/list`.
///
/// Fields the gateway does not interpret are kept in `extra` so the
/// descriptor is re-published unchanged apart from its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    /// Build a descriptor with no extra fields.
    pub fn new(name: &str, description: &str, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema,
            extra: serde_json::Map::new(),
        }
    }

    /// Render `name(param: type, opt?: type)` from the input schema.
    pub fn signature(&self) -> String {
        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let params = self
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                props
                    .iter()
                    .map(|(key, prop)| {
                        let opt = if required.contains(&key.as_str()) { "" } else { "?" };
                        let ty = prop.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                        format!("{key}{opt}: {ty}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        format!("{}({params})", self.name)
    }
}

/// `tools/list` response page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Uniform result shape for every call: content blocks plus an error flag.
///
/// Worker results are deserialized into this verbatim; unknown top-level
/// fields (e.g. `structuredContent`) ride along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, rename = "isError", skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl ToolResult {
    /// A successful result with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_block(text.into())],
            is_error: false,
            extra: serde_json::Map::new(),
        }
    }

    /// An error-flagged result with one text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_block(text.into())],
            is_error: true,
            extra: serde_json::Map::new(),
        }
    }

    /// Convert a gateway error into an error-flagged result.
    pub fn from_error(err: &GatewayError) -> Self {
        Self::error(err.to_string())
    }

    /// All text blocks joined with newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn text_block(text: String) -> serde_json::Value {
    serde_json::json!({ "type": "text", "text": text })
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Default connection timeout for a worker handshake (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Static definition of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay; values may contain `${VAR}` / `${VAR:-default}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_activate: bool,
    /// Connection (handshake) timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
}

impl WorkerConfig {
    /// A worker definition with default options.
    pub fn new(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
            env: HashMap::new(),
            auto_activate: false,
            timeout: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

/// Top-level gateway configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub services: Vec<WorkerConfig>,
}

// ─── Runtime State ───────────────────────────────────────────────────────────

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Inactive,
    Activating,
    Active,
    Error,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Inactive => "inactive",
            WorkerStatus::Activating => "activating",
            WorkerStatus::Active => "active",
            WorkerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Mutable runtime record for one configured worker.
///
/// `tools` is non-empty only while `status` is `Active`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub tools: Vec<ToolDefinition>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkerState {
    /// A fresh `Inactive` record.
    pub fn inactive() -> Self {
        Self {
            status: WorkerStatus::Inactive,
            tools: Vec::new(),
            activated_at: None,
            last_error: None,
        }
    }
}

/// Where a namespaced tool name points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub worker: String,
    pub original_name: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_message_classification() {
        let resp: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert!(resp.is_response());
        assert_eq!(resp.numeric_id(), Some(7));

        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"roots/list"}"#).unwrap();
        assert!(!req.is_response());
        assert_eq!(req.numeric_id(), None);
    }

    #[test]
    fn test_tool_definition_keeps_unknown_fields() {
        let json = r#"{
            "name": "echo",
            "description": "Echo text",
            "inputSchema": {"type": "object"},
            "annotations": {"readOnlyHint": true}
        }"#;
        let tool: ToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.extra["annotations"]["readOnlyHint"], true);

        let out = serde_json::to_value(&tool).unwrap();
        assert_eq!(out["annotations"]["readOnlyHint"], true);
        assert_eq!(out["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_tool_definition_missing_schema_defaults() {
        let tool: ToolDefinition = serde_json::from_str(r#"{"name": "bare"}"#).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_none());
    }

    #[test]
    fn test_signature_marks_optional_params() {
        let tool = ToolDefinition::new(
            "search",
            "Search things",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "number"},
                    "query": {"type": "string"}
                },
                "required": ["query"]
            }),
        );
        assert_eq!(tool.signature(), "search(limit?: number, query: string)");
    }

    #[test]
    fn test_tool_result_wire_shape() {
        let ok = serde_json::to_value(ToolResult::text("done")).unwrap();
        assert_eq!(ok["content"][0]["type"], "text");
        assert!(ok.get("isError").is_none());

        let err = serde_json::to_value(ToolResult::error("boom")).unwrap();
        assert_eq!(err["isError"], true);
    }

    #[test]
    fn test_tool_result_preserves_worker_fields() {
        let raw = serde_json::json!({
            "content": [{"type": "text", "text": "pong"}],
            "structuredContent": {"ok": true}
        });
        let result: ToolResult = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(result.text_content(), "pong");
        assert_eq!(serde_json::to_value(&result).unwrap(), raw);
    }

    #[test]
    fn test_worker_config_defaults() {
        let cfg: WorkerConfig =
            serde_json::from_str(r#"{"name": "x", "command": "npx"}"#).unwrap();
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_empty());
        assert!(!cfg.auto_activate);
        assert_eq!(cfg.timeout, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_worker_config_camel_case() {
        let cfg: WorkerConfig = serde_json::from_str(
            r#"{"name": "x", "command": "bun", "autoActivate": true, "timeout": 5000}"#,
        )
        .unwrap();
        assert!(cfg.auto_activate);
        assert_eq!(cfg.timeout, 5000);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(WorkerStatus::Activating.to_string(), "activating");
        assert_eq!(WorkerStatus::Error.to_string(), "error");
    }
}
