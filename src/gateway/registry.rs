//! Tool registry: the namespaced catalog across all active workers.
//!
//! Provides:
//! - Route lookup by namespaced name (`worker_tool`)
//! - The combined, renamed tool catalog for `tools/list`
//! - Atomic add/remove of every entry owned by one worker
//!
//! Not synchronized itself; the supervisor serializes access.

use std::collections::{BTreeMap, HashMap};

use super::types::{ToolDefinition, ToolRoute};

/// Separator between worker name and tool name. Reserved in worker names.
pub const NAMESPACE_SEPARATOR: char = '_';

/// Build `"{worker}_{tool}"`.
pub fn namespaced_name(worker: &str, tool: &str) -> String {
    format!("{worker}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced name at the first separator.
///
/// Worker names never contain the separator, so the split is unambiguous.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
        .filter(|(worker, tool)| !worker.is_empty() && !tool.is_empty())
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Namespaced routes and catalogs for every registered worker.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `namespaced name → (worker, original name)`.
    routes: HashMap<String, ToolRoute>,
    /// `worker → renamed descriptors`, in the worker's catalog order.
    catalogs: BTreeMap<String, Vec<ToolDefinition>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker's catalog under its namespace.
    ///
    /// Callers unregister first; any previous entries for the worker are
    /// replaced. Duplicate tool names within one catalog keep the first.
    pub fn register_worker(&mut self, worker: &str, tools: &[ToolDefinition]) {
        self.unregister_worker(worker);

        let mut renamed = Vec::with_capacity(tools.len());
        for tool in tools {
            let name = namespaced_name(worker, &tool.name);
            if self.routes.contains_key(&name) {
                tracing::warn!(worker, tool = %tool.name, "duplicate tool name in catalog, skipping");
                continue;
            }
            self.routes.insert(
                name.clone(),
                ToolRoute {
                    worker: worker.to_string(),
                    original_name: tool.name.clone(),
                },
            );
            renamed.push(ToolDefinition {
                name,
                ..tool.clone()
            });
        }

        self.catalogs.insert(worker.to_string(), renamed);
    }

    /// Remove every route and catalog entry owned by a worker.
    pub fn unregister_worker(&mut self, worker: &str) {
        if let Some(tools) = self.catalogs.remove(worker) {
            for tool in tools {
                self.routes.remove(&tool.name);
            }
        }
    }

    /// Look up a namespaced tool name.
    pub fn resolve(&self, name: &str) -> Option<&ToolRoute> {
        self.routes.get(name)
    }

    /// Every renamed descriptor, grouped by worker name.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        self.catalogs.values().flatten().cloned().collect()
    }

    /// Number of tools registered for one worker.
    pub fn tools_for_worker(&self, worker: &str) -> usize {
        self.catalogs.get(worker).map_or(0, Vec::len)
    }

    /// Names of workers with a registered catalog.
    pub fn worker_names(&self) -> Vec<&str> {
        self.catalogs.keys().map(String::as_str).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
