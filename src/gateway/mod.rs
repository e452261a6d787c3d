//! Gateway core: supervises stdio tool workers and aggregates their tools.
//!
//! This module handles:
//! - Spawning worker processes and speaking JSON-RPC over their stdio
//! - Per-worker lifecycle (activate, deactivate, reload, crash detection)
//! - The namespaced tool catalog across all active workers
//! - Routing tool calls, activating cold workers on demand
//! - Management tools and persisted worker configuration

pub mod config;
pub mod errors;
pub mod management;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigStore, FileConfigStore, MemoryConfigStore};
pub use errors::GatewayError;
pub use management::{is_management_tool, management_tools, ManagementSurface};
pub use registry::ToolRegistry;
pub use router::CallRouter;
pub use supervisor::{NewWorker, ToolsChanged, WorkerSupervisor};
pub use types::{GatewayConfig, ToolDefinition, ToolResult, WorkerConfig, WorkerState, WorkerStatus};
