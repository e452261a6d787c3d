//! Gateway error types.

use thiserror::Error;

/// Errors that can occur inside the gateway core.
///
/// None of these escape a management or routing call: each public operation
/// converts them into an error-flagged [`ToolResult`](super::types::ToolResult).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The worker name is not configured.
    #[error("Unknown service: {name}")]
    UnknownWorker { name: String },

    /// `add` was called with a name that already exists.
    #[error("Service already exists: {name}")]
    DuplicateWorker { name: String },

    /// A management call omitted a required field.
    #[error("Missing required argument: {field}")]
    MissingArgument { field: String },

    /// A worker definition failed validation.
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Spawn, handshake, or catalog fetch failed.
    #[error("failed to connect to '{name}': {reason}")]
    ConnectionFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for '{name}': {reason}")]
    Transport { name: String, reason: String },

    /// The worker returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The worker's channel closed while it was active.
    #[error("{name} crashed: {reason}")]
    Crashed { name: String, reason: String },

    /// Unresolvable tool name or unreachable worker.
    #[error("{reason}")]
    Routing { reason: String },

    /// The configuration store could not be read or written.
    #[error("config store error: {reason}")]
    ConfigStore { reason: String },
}

impl GatewayError {
    /// Shorthand for a routing failure on an unknown namespaced name.
    pub fn unknown_tool(name: &str) -> Self {
        GatewayError::Routing {
            reason: format!("Unknown tool: {name}"),
        }
    }
}
