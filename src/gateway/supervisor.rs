//! Worker supervisor: owns every worker's lifecycle state.
//!
//! Single writer of the worker records and the tool registry. Lifecycle
//! transitions (activate, deactivate, reload, crash handling, remove) are
//! serialized per worker by that worker's lifecycle lock; different workers
//! proceed in parallel. Status reads only take the short record lock, so
//! `services` can observe `activating` while a handshake is in progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use super::config::{validate_worker, ConfigStore};
use super::errors::GatewayError;
use super::registry::ToolRegistry;
use super::session::{SessionEvent, WorkerSession};
use super::types::{
    GatewayConfig, ToolDefinition, ToolResult, ToolRoute, WorkerConfig, WorkerState, WorkerStatus,
};

/// `lastError` recorded when a worker's channel closes while active.
pub const CRASH_REASON: &str = "process exited unexpectedly";

/// Broadcast whenever the combined tool catalog may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolsChanged;

// ─── Worker Slots ────────────────────────────────────────────────────────────

struct WorkerRecord {
    config: WorkerConfig,
    state: WorkerState,
    session: Option<Arc<WorkerSession>>,
}

struct WorkerSlot {
    /// Held for the whole of every lifecycle transition on this worker.
    lifecycle: tokio::sync::Mutex<()>,
    record: Mutex<WorkerRecord>,
}

impl WorkerSlot {
    fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: tokio::sync::Mutex::new(()),
            record: Mutex::new(WorkerRecord {
                config,
                state: WorkerState::inactive(),
                session: None,
            }),
        })
    }

    fn record(&self) -> MutexGuard<'_, WorkerRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Options accepted by [`WorkerSupervisor::add`].
#[derive(Debug, Clone, Default)]
pub struct NewWorker {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: std::collections::HashMap<String, String>,
    pub timeout: Option<u64>,
}

// ─── WorkerSupervisor ────────────────────────────────────────────────────────

/// Owns worker state, live sessions and the tool registry.
pub struct WorkerSupervisor {
    workers: RwLock<BTreeMap<String, Arc<WorkerSlot>>>,
    registry: Mutex<ToolRegistry>,
    store: Arc<dyn ConfigStore>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    changes: broadcast::Sender<ToolsChanged>,
    next_generation: AtomicU64,
    /// Serializes read-modify-write of the persisted configuration.
    config_writes: tokio::sync::Mutex<()>,
}

impl WorkerSupervisor {
    /// Create a supervisor with every configured worker `Inactive`.
    ///
    /// Must be called inside a Tokio runtime: it spawns the task that turns
    /// session close events into crash handling.
    pub fn new(configs: Vec<WorkerConfig>, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        let (session_events, events_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(64);

        let workers = configs
            .into_iter()
            .map(|config| (config.name.clone(), WorkerSlot::new(config)))
            .collect();

        let supervisor = Arc::new(Self {
            workers: RwLock::new(workers),
            registry: Mutex::new(ToolRegistry::new()),
            store,
            session_events,
            changes,
            next_generation: AtomicU64::new(1),
            config_writes: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(watch_sessions(Arc::downgrade(&supervisor), events_rx));
        supervisor
    }

    /// Subscribe to catalog-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ToolsChanged> {
        self.changes.subscribe()
    }

    fn notify_tools_changed(&self) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.changes.send(ToolsChanged);
    }

    fn registry(&self) -> MutexGuard<'_, ToolRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, name: &str) -> Option<Arc<WorkerSlot>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Whether `slot` is still the registered slot for `name` (not removed
    /// while we waited for its lifecycle lock).
    fn is_current(&self, name: &str, slot: &Arc<WorkerSlot>) -> bool {
        self.slot(name).is_some_and(|s| Arc::ptr_eq(&s, slot))
    }

    fn slots(&self) -> Vec<(String, Arc<WorkerSlot>)> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect()
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Configured worker names, sorted.
    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    /// Snapshot of one worker's runtime state.
    pub fn state(&self, name: &str) -> Option<WorkerState> {
        self.slot(name).map(|slot| slot.record().state.clone())
    }

    /// Snapshot of one worker's definition.
    pub fn config(&self, name: &str) -> Option<WorkerConfig> {
        self.slot(name).map(|slot| slot.record().config.clone())
    }

    /// The live session, only while the worker is `Active`.
    pub fn session(&self, name: &str) -> Option<Arc<WorkerSession>> {
        let slot = self.slot(name)?;
        let record = slot.record();
        if record.state.status != WorkerStatus::Active {
            return None;
        }
        record.session.clone()
    }

    /// Resolve a namespaced tool name.
    pub fn resolve(&self, namespaced: &str) -> Option<ToolRoute> {
        self.registry().resolve(namespaced).cloned()
    }

    /// Combined namespaced catalog of all active workers.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        self.registry().all_tools()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Activate a worker: spawn, handshake, register its tools.
    ///
    /// Already `Active` is a no-op success reporting the tool count.
    pub async fn activate(&self, name: &str) -> ToolResult {
        let Some(slot) = self.slot(name) else {
            return unknown_worker(name);
        };
        let _lifecycle = slot.lifecycle.lock().await;
        if !self.is_current(name, &slot) {
            return unknown_worker(name);
        }
        self.activate_locked(name, &slot).await
    }

    async fn activate_locked(&self, name: &str, slot: &WorkerSlot) -> ToolResult {
        let config = {
            let mut record = slot.record();
            if record.state.status == WorkerStatus::Active {
                return ToolResult::text(format!(
                    "{name} is already active ({} tools)",
                    record.state.tools.len()
                ));
            }
            record.state.status = WorkerStatus::Activating;
            record.state.last_error = None;
            record.config.clone()
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tracing::info!(worker = name, generation, "activating worker");

        match WorkerSession::connect(&config, generation, self.session_events.clone()).await {
            Ok(session) => {
                let tools = session.tools().to_vec();
                let pid = session.pid();
                self.registry().register_worker(name, &tools);
                {
                    let mut record = slot.record();
                    record.session = Some(Arc::new(session));
                    record.state.status = WorkerStatus::Active;
                    record.state.tools = tools.clone();
                    record.state.activated_at = Some(Utc::now());
                }
                self.notify_tools_changed();

                tracing::info!(worker = name, tools = tools.len(), pid = ?pid, "worker activated");
                ToolResult::text(activation_summary(name, &tools))
            }
            Err(e) => {
                let cause = match &e {
                    GatewayError::ConnectionFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                {
                    let mut record = slot.record();
                    record.state.status = WorkerStatus::Error;
                    record.state.last_error = Some(cause.clone());
                }
                tracing::warn!(worker = name, error = %cause, "worker activation failed");
                ToolResult::error(format!("Failed to activate {name}: {cause}"))
            }
        }
    }

    /// Deactivate a worker: disconnect, drop its tools, reset its state.
    ///
    /// Already `Inactive` is a no-op success.
    pub async fn deactivate(&self, name: &str) -> ToolResult {
        let Some(slot) = self.slot(name) else {
            return unknown_worker(name);
        };
        let _lifecycle = slot.lifecycle.lock().await;
        if !self.is_current(name, &slot) {
            return unknown_worker(name);
        }
        self.deactivate_locked(name, &slot).await
    }

    async fn deactivate_locked(&self, name: &str, slot: &WorkerSlot) -> ToolResult {
        let session = {
            let mut record = slot.record();
            if record.state.status == WorkerStatus::Inactive {
                return ToolResult::text(format!("{name} is already inactive"));
            }
            record.session.take()
        };

        // The transport is marked closing before the pipe shuts, so this
        // teardown never reaches crash handling.
        if let Some(session) = session {
            session.disconnect().await;
        }

        self.registry().unregister_worker(name);
        {
            let mut record = slot.record();
            record.state = WorkerState::inactive();
        }
        self.notify_tools_changed();

        tracing::info!(worker = name, "worker deactivated");
        ToolResult::text(format!("✓ {name} deactivated"))
    }

    /// Deactivate then activate, as one serialized transition.
    pub async fn reload(&self, name: &str) -> ToolResult {
        let Some(slot) = self.slot(name) else {
            return unknown_worker(name);
        };
        let _lifecycle = slot.lifecycle.lock().await;
        if !self.is_current(name, &slot) {
            return unknown_worker(name);
        }
        self.deactivate_locked(name, &slot).await;
        self.activate_locked(name, &slot).await
    }

    /// Alias of [`reload`](Self::reload).
    pub async fn restart(&self, name: &str) -> ToolResult {
        self.reload(name).await
    }

    /// React to a session closing on its own.
    ///
    /// Ignored unless the worker is `Active` on the very session that closed;
    /// anything else is an intentional teardown racing the signal.
    async fn handle_crash(&self, name: &str, generation: u64) {
        let Some(slot) = self.slot(name) else {
            return;
        };
        let _lifecycle = slot.lifecycle.lock().await;

        let session = {
            let mut record = slot.record();
            let current = record
                .session
                .as_ref()
                .is_some_and(|s| s.generation() == generation);
            if record.state.status != WorkerStatus::Active || !current {
                tracing::debug!(worker = name, generation, "ignoring stale close event");
                return;
            }
            record.state = WorkerState {
                status: WorkerStatus::Error,
                tools: Vec::new(),
                activated_at: None,
                last_error: Some(CRASH_REASON.to_string()),
            };
            record.session.take()
        };

        self.registry().unregister_worker(name);
        self.notify_tools_changed();
        tracing::warn!(worker = name, "worker crashed, tools removed");

        // Reap whatever is left of the process.
        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    // ─── Reports ─────────────────────────────────────────────────────────

    /// `name: status | tools: N | uptime: Ns` per worker.
    pub fn services(&self) -> ToolResult {
        let now = Utc::now();
        let lines: Vec<String> = self
            .slots()
            .iter()
            .map(|(name, slot)| {
                let state = slot.record().state.clone();
                let uptime = state
                    .activated_at
                    .map(|at| format!("{}s", (now - at).num_seconds().max(0)))
                    .unwrap_or_else(|| "-".to_string());
                let error = state
                    .last_error
                    .map(|e| format!(" | error: {e}"))
                    .unwrap_or_default();
                format!(
                    "{name}: {} | tools: {} | uptime: {uptime}{error}",
                    state.status,
                    state.tools.len()
                )
            })
            .collect();

        if lines.is_empty() {
            return ToolResult::text("No services configured");
        }
        ToolResult::text(lines.join("\n"))
    }

    /// Ping every active worker. Read-only; one failure never aborts the
    /// report.
    pub async fn health(&self) -> ToolResult {
        let checks = self.slots().into_iter().map(|(name, slot)| async move {
            let (state, session) = {
                let record = slot.record();
                (record.state.clone(), record.session.clone())
            };

            if state.status != WorkerStatus::Active {
                let error = state
                    .last_error
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default();
                return format!("{name}: {}{error}", state.status);
            }

            let Some(session) = session else {
                return format!("{name}: error (no connection)");
            };

            let healthy = session.ping().await;
            let pid = session
                .pid()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!(
                "{name}: {} (pid: {pid})",
                if healthy { "healthy" } else { "unhealthy" }
            )
        });

        let lines = futures::future::join_all(checks).await;
        if lines.is_empty() {
            return ToolResult::text("No services configured");
        }
        ToolResult::text(lines.join("\n"))
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Define and persist a new worker. It starts `Inactive` and is never
    /// auto-activated.
    pub async fn add(&self, new: NewWorker) -> ToolResult {
        match self.try_add(new).await {
            Ok(name) => ToolResult::text(format!(
                "✓ {name} added. Use activate(\"{name}\") to start it."
            )),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    async fn try_add(&self, new: NewWorker) -> Result<String, GatewayError> {
        let mut config = WorkerConfig::new(&new.name, &new.command, new.args);
        config.env = new.env;
        if let Some(timeout) = new.timeout {
            config.timeout = timeout;
        }
        validate_worker(&config)?;

        let _writes = self.config_writes.lock().await;
        if self.is_configured(&config.name) {
            return Err(GatewayError::DuplicateWorker { name: config.name });
        }

        let entry = config.clone();
        self.update_store(move |persisted| {
            if persisted.services.iter().any(|s| s.name == entry.name) {
                return Err(GatewayError::DuplicateWorker { name: entry.name });
            }
            persisted.services.push(entry);
            Ok(())
        })
        .await?;

        let name = config.name.clone();
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), WorkerSlot::new(config));
        tracing::info!(worker = %name, "worker added");
        Ok(name)
    }

    /// Deactivate (if needed), forget, and un-persist a worker.
    pub async fn remove(&self, name: &str) -> ToolResult {
        let Some(slot) = self.slot(name) else {
            return unknown_worker(name);
        };
        let _lifecycle = slot.lifecycle.lock().await;
        if !self.is_current(name, &slot) {
            return unknown_worker(name);
        }

        let status = slot.record().state.status;
        if status != WorkerStatus::Inactive {
            self.deactivate_locked(name, &slot).await;
        }

        let _writes = self.config_writes.lock().await;
        let target = name.to_string();
        let removed = self
            .update_store(move |persisted| {
                persisted.services.retain(|s| s.name != target);
                Ok(())
            })
            .await;

        match removed {
            Ok(()) => {
                self.workers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(name);
                tracing::info!(worker = name, "worker removed");
                ToolResult::text(format!("✓ {name} removed"))
            }
            Err(e) => ToolResult::from_error(&e),
        }
    }

    /// Load, edit and save the persisted configuration off the runtime.
    /// Callers hold `config_writes`.
    async fn update_store<F>(&self, edit: F) -> Result<(), GatewayError>
    where
        F: FnOnce(&mut GatewayConfig) -> Result<(), GatewayError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut persisted = store.load()?;
            edit(&mut persisted)?;
            store.save(&persisted)
        })
        .await
        .map_err(|e| GatewayError::ConfigStore {
            reason: format!("config update did not complete: {e}"),
        })?
    }

    // ─── Startup & Shutdown ──────────────────────────────────────────────

    /// Activate every worker flagged `autoActivate`, concurrently.
    pub async fn auto_activate(&self) -> Vec<(String, ToolResult)> {
        let names: Vec<String> = self
            .slots()
            .into_iter()
            .filter(|(_, slot)| slot.record().config.auto_activate)
            .map(|(name, _)| name)
            .collect();
        if names.is_empty() {
            return Vec::new();
        }

        tracing::info!(workers = ?names, "auto-activating workers");
        let activations = names.iter().map(|name| async move {
            let result = self.activate(name).await;
            (name.clone(), result)
        });
        futures::future::join_all(activations).await
    }

    /// Deactivate every worker that is not `Inactive`. Best-effort: each
    /// worker is torn down independently.
    pub async fn shutdown(&self) {
        let teardowns = self.slots().into_iter().map(|(name, slot)| async move {
            let _lifecycle = slot.lifecycle.lock().await;
            let status = slot.record().state.status;
            if status != WorkerStatus::Inactive {
                self.deactivate_locked(&name, &slot).await;
            }
        });
        futures::future::join_all(teardowns).await;
        tracing::info!("all workers stopped");
    }
}

async fn watch_sessions(
    supervisor: Weak<WorkerSupervisor>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        match event {
            SessionEvent::Closed { worker, generation } => {
                tokio::spawn(async move {
                    supervisor.handle_crash(&worker, generation).await;
                });
            }
        }
    }
}

fn unknown_worker(name: &str) -> ToolResult {
    ToolResult::from_error(&GatewayError::UnknownWorker {
        name: name.to_string(),
    })
}

/// Activation report: one line per tool plus usage guidance.
fn activation_summary(name: &str, tools: &[ToolDefinition]) -> String {
    let mut lines = vec![format!("✓ {name} activated — {} tools:", tools.len()), String::new()];
    for tool in tools {
        let desc = tool
            .description
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| format!(" — {d}"))
            .unwrap_or_default();
        lines.push(format!("• {}{desc}", tool.signature()));
    }
    lines.push(String::new());
    lines.push(format!(
        "Use call({{service: \"{name}\", tool: \"<name>\", args: {{...}}}}) to call these tools."
    ));
    lines.join("\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
