//! Call router: forwards namespaced tool calls to the owning worker.
//!
//! A call against a worker with no live session activates it first; the
//! first call to a cold worker pays its full startup cost.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::errors::GatewayError;
use super::registry::{namespaced_name, split_namespaced};
use super::supervisor::WorkerSupervisor;
use super::types::{ToolResult, ToolRoute, WorkerStatus};

#[derive(Clone)]
pub struct CallRouter {
    supervisor: Arc<WorkerSupervisor>,
}

impl CallRouter {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Route a namespaced tool call (`worker_tool`).
    pub async fn route(&self, namespaced: &str, arguments: Map<String, Value>) -> ToolResult {
        let route = match self.supervisor.resolve(namespaced) {
            Some(route) => route,
            None => match self.cold_route(namespaced).await {
                Ok(route) => route,
                Err(result) => return result,
            },
        };
        self.forward(&route.worker, &route.original_name, arguments)
            .await
    }

    /// A name that does not resolve may still belong to a configured worker
    /// that simply is not running yet. Activate it once and look again.
    async fn cold_route(&self, namespaced: &str) -> Result<ToolRoute, ToolResult> {
        let unknown = || ToolResult::from_error(&GatewayError::unknown_tool(namespaced));

        let Some((worker, _)) = split_namespaced(namespaced) else {
            return Err(unknown());
        };
        match self.supervisor.state(worker) {
            None => return Err(unknown()),
            // Running, and the tool is simply not in its catalog.
            Some(state) if state.status == WorkerStatus::Active => return Err(unknown()),
            Some(_) => {}
        }

        tracing::info!(worker, tool = namespaced, "auto-activating worker for call");
        let activation = self.supervisor.activate(worker).await;
        if activation.is_error {
            return Err(activation);
        }
        self.supervisor
            .resolve(namespaced)
            .ok_or_else(|| self.missing_after_activation(namespaced, worker))
    }

    /// The worker was started for this call but does not expose the tool.
    /// Say so, since the activation is left in place.
    fn missing_after_activation(&self, namespaced: &str, worker: &str) -> ToolResult {
        let exposed: Vec<String> = self
            .supervisor
            .state(worker)
            .map(|state| {
                state
                    .tools
                    .iter()
                    .map(|tool| namespaced_name(worker, &tool.name))
                    .collect()
            })
            .unwrap_or_default();
        let listing = if exposed.is_empty() {
            "it exposes no tools".to_string()
        } else {
            format!("it exposes: {}", exposed.join(", "))
        };
        ToolResult::error(format!(
            "Unknown tool: {namespaced} ({worker} was activated to look it up; {listing})"
        ))
    }

    /// Call `tool` on `worker` by plain (non-namespaced) names.
    pub async fn call_direct(
        &self,
        worker: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> ToolResult {
        if !self.supervisor.is_configured(worker) {
            return ToolResult::from_error(&GatewayError::UnknownWorker {
                name: worker.to_string(),
            });
        }
        self.forward(worker, tool, arguments).await
    }

    async fn forward(&self, worker: &str, tool: &str, arguments: Map<String, Value>) -> ToolResult {
        let session = match self.supervisor.session(worker) {
            Some(session) => session,
            None => {
                let activation = self.supervisor.activate(worker).await;
                if activation.is_error {
                    return activation;
                }
                match self.supervisor.session(worker) {
                    Some(session) => session,
                    // Crashed between activation and lookup.
                    None => {
                        return ToolResult::from_error(&GatewayError::Routing {
                            reason: format!("Service {worker} is not active"),
                        })
                    }
                }
            }
        };

        tracing::debug!(worker, tool, "forwarding tool call");
        match session.call_tool(tool, arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(worker, tool, error = %e, "tool call failed");
                ToolResult::error(format!("Error calling {tool} on {worker}: {e}"))
            }
        }
    }
}
