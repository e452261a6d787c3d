//! Management tools: the fixed, gateway-owned part of the catalog.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::errors::GatewayError;
use super::router::CallRouter;
use super::supervisor::{NewWorker, WorkerSupervisor};
use super::types::{ToolDefinition, ToolResult};

pub const MANAGEMENT_TOOL_NAMES: [&str; 9] = [
    "services",
    "activate",
    "deactivate",
    "reload",
    "restart",
    "health",
    "add",
    "remove",
    "call",
];

pub fn is_management_tool(name: &str) -> bool {
    MANAGEMENT_TOOL_NAMES.contains(&name)
}

fn name_schema(verb: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "description": format!("Service name to {verb}") }
        },
        "required": ["name"]
    })
}

fn no_args_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Descriptors for every management tool, in a fixed order.
pub fn management_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "services",
            "List all registered services with their status, tool count, and uptime",
            no_args_schema(),
        ),
        ToolDefinition::new(
            "activate",
            "Activate a service: spawn its process, load its tools",
            name_schema("activate"),
        ),
        ToolDefinition::new(
            "deactivate",
            "Deactivate a service: stop its process, remove its tools",
            name_schema("deactivate"),
        ),
        ToolDefinition::new(
            "reload",
            "Reload a service: disconnect and reconnect (picks up code changes)",
            name_schema("reload"),
        ),
        ToolDefinition::new(
            "restart",
            "Restart a service: kill process and respawn",
            name_schema("restart"),
        ),
        ToolDefinition::new(
            "health",
            "Check health of all active services via ping",
            no_args_schema(),
        ),
        ToolDefinition::new(
            "add",
            "Add a new MCP service to the gateway config. Supports npx, bunx, node, bun, ssh, etc.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Unique service name" },
                    "command": {
                        "type": "string",
                        "description": "Command to run (e.g. npx, bunx, bun, node, ssh)"
                    },
                    "args": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Command arguments"
                    },
                    "env": { "type": "object", "description": "Environment variables" },
                    "timeout": {
                        "type": "number",
                        "description": "Connection timeout in ms (default: 30000)"
                    }
                },
                "required": ["name", "command"]
            }),
        ),
        ToolDefinition::new(
            "remove",
            "Remove an MCP service from the gateway config",
            name_schema("remove"),
        ),
        ToolDefinition::new(
            "call",
            "Call any tool on any service, activating it if needed. Use activate first to see available tools and their schemas.",
            json!({
                "type": "object",
                "properties": {
                    "service": { "type": "string", "description": "Service name (e.g. x, helm, squad)" },
                    "tool": { "type": "string", "description": "Tool name within the service" },
                    "args": { "type": "object", "description": "Tool arguments" }
                },
                "required": ["service", "tool"]
            }),
        ),
    ]
}

// ─── ManagementSurface ───────────────────────────────────────────────────────

/// Dispatches management tool calls to the supervisor and router.
#[derive(Clone)]
pub struct ManagementSurface {
    supervisor: Arc<WorkerSupervisor>,
    router: CallRouter,
}

impl ManagementSurface {
    pub fn new(supervisor: Arc<WorkerSupervisor>, router: CallRouter) -> Self {
        Self { supervisor, router }
    }

    /// Handle one management call. Never fails: argument problems come back
    /// as error-flagged results.
    pub async fn handle(&self, tool: &str, arguments: Option<Map<String, Value>>) -> ToolResult {
        let args = arguments.unwrap_or_default();
        match self.dispatch(tool, &args).await {
            Ok(result) => result,
            Err(e) => ToolResult::from_error(&e),
        }
    }

    async fn dispatch(&self, tool: &str, args: &Map<String, Value>) -> Result<ToolResult, GatewayError> {
        let result = match tool {
            "services" => self.supervisor.services(),
            "activate" => self.supervisor.activate(required_str(args, "name")?).await,
            "deactivate" => self.supervisor.deactivate(required_str(args, "name")?).await,
            "reload" => self.supervisor.reload(required_str(args, "name")?).await,
            "restart" => self.supervisor.restart(required_str(args, "name")?).await,
            "health" => self.supervisor.health().await,
            "add" => self.supervisor.add(parse_new_worker(args)?).await,
            "remove" => self.supervisor.remove(required_str(args, "name")?).await,
            "call" => {
                let (service, tool) = match (optional_str(args, "service"), optional_str(args, "tool")) {
                    (Some(service), Some(tool)) => (service, tool),
                    _ => {
                        return Err(GatewayError::MissingArgument {
                            field: "service and tool".into(),
                        })
                    }
                };
                let call_args = match args.get("args") {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(map)) => map.clone(),
                    Some(_) => {
                        return Err(GatewayError::InvalidConfig {
                            reason: "'args' must be an object".into(),
                        })
                    }
                };
                self.router.call_direct(service, tool, call_args).await
            }
            other => {
                return Err(GatewayError::Routing {
                    reason: format!("Unknown management tool: {other}"),
                })
            }
        };
        Ok(result)
    }
}

// ─── Argument helpers ────────────────────────────────────────────────────────

fn optional_str<'a>(args: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn required_str<'a>(args: &'a Map<String, Value>, field: &str) -> Result<&'a str, GatewayError> {
    optional_str(args, field).ok_or_else(|| GatewayError::MissingArgument {
        field: field.to_string(),
    })
}

fn parse_new_worker(args: &Map<String, Value>) -> Result<NewWorker, GatewayError> {
    let name = required_str(args, "name")?.to_string();
    let command = required_str(args, "command")?.to_string();

    let worker_args = match args.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| GatewayError::InvalidConfig {
                    reason: "'args' must be an array of strings".into(),
                })
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(GatewayError::InvalidConfig {
                reason: "'args' must be an array of strings".into(),
            })
        }
    };

    let env = match args.get("env") {
        None | Some(Value::Null) => HashMap::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(_) | Value::Bool(_) => value.to_string(),
                    _ => {
                        return Err(GatewayError::InvalidConfig {
                            reason: format!("env value for '{key}' must be a string"),
                        })
                    }
                };
                Ok((key.clone(), value))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(GatewayError::InvalidConfig {
                reason: "'env' must be an object".into(),
            })
        }
    };

    let timeout = match args.get("timeout") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms > 0.0)
                .map(|ms| ms as u64)
                .ok_or_else(|| GatewayError::InvalidConfig {
                    reason: "'timeout' must be a positive number of milliseconds".into(),
                })?,
        ),
    };

    Ok(NewWorker {
        name,
        command,
        args: worker_args,
        env,
        timeout,
    })
}
