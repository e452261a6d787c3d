//! End-to-end supervision tests against real worker processes.
//!
//! Workers are `/bin/sh` running `tests/fixtures/fake_worker.sh`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use mcphub::gateway::{
    CallRouter, ConfigStore, FileConfigStore, GatewayConfig, ManagementSurface, MemoryConfigStore,
    ToolsChanged, WorkerConfig, WorkerStatus, WorkerSupervisor,
};
use mcphub::server::GatewayServer;

fn fixture() -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/fake_worker.sh")
        .display()
        .to_string()
}

fn worker(name: &str, tool: &str, spawn_log: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::new(name, "/bin/sh", vec![fixture(), name.into(), tool.into()]);
    config
        .env
        .insert("SPAWN_LOG".into(), spawn_log.display().to_string());
    config.timeout = 10_000;
    config
}

struct Harness {
    supervisor: Arc<WorkerSupervisor>,
    router: CallRouter,
    management: ManagementSurface,
    spawn_log: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let spawn_log = dir.path().join("spawns.log");
        let configs = vec![
            worker("alpha", "ping", &spawn_log),
            worker("beta", "echo", &spawn_log),
        ];
        let store = Arc::new(MemoryConfigStore::new(GatewayConfig {
            services: configs.clone(),
        }));
        let supervisor = WorkerSupervisor::new(configs, store);
        let router = CallRouter::new(Arc::clone(&supervisor));
        let management = ManagementSurface::new(Arc::clone(&supervisor), router.clone());
        Self {
            supervisor,
            router,
            management,
            spawn_log,
            _dir: dir,
        }
    }

    fn spawns(&self, label: &str) -> usize {
        std::fs::read_to_string(&self.spawn_log)
            .unwrap_or_default()
            .lines()
            .filter(|line| *line == format!("start {label}"))
            .count()
    }

    fn tool_names(&self) -> Vec<String> {
        self.supervisor
            .all_tools()
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    async fn wait_for_status(&self, name: &str, status: WorkerStatus) {
        for _ in 0..100 {
            if self.supervisor.state(name).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "{name} never reached {status}, state: {:?}",
            self.supervisor.state(name)
        );
    }
}

fn args(value: Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

#[tokio::test]
async fn test_two_workers_catalog_and_call() {
    let h = Harness::new();

    let result = h.supervisor.activate("alpha").await;
    assert!(!result.is_error, "{}", result.text_content());
    let result = h.supervisor.activate("beta").await;
    assert!(!result.is_error, "{}", result.text_content());

    assert_eq!(h.tool_names(), vec!["alpha_ping", "beta_echo"]);

    let result = h
        .management
        .handle("call", args(json!({"service": "alpha", "tool": "ping"})))
        .await;
    assert!(!result.is_error);
    assert_eq!(result.text_content(), "alpha says hi");

    let result = h.supervisor.deactivate("alpha").await;
    assert_eq!(result.text_content(), "✓ alpha deactivated");
    assert_eq!(h.tool_names(), vec!["beta_echo"]);
    assert!(h.supervisor.resolve("alpha_ping").is_none());

    h.supervisor.shutdown().await;
    assert!(h.supervisor.all_tools().is_empty());
    assert_eq!(h.supervisor.state("beta").unwrap().status, WorkerStatus::Inactive);
}

#[tokio::test]
async fn test_activation_report_and_idempotence() {
    let h = Harness::new();

    let text = h.supervisor.activate("alpha").await.text_content();
    assert!(text.starts_with("✓ alpha activated — 1 tools:"), "{text}");
    assert!(text.contains("• ping(text?: string) — fake ping"), "{text}");

    let again = h.supervisor.activate("alpha").await;
    assert!(!again.is_error);
    assert_eq!(again.text_content(), "alpha is already active (1 tools)");
    assert_eq!(h.spawns("alpha"), 1);

    let state = h.supervisor.state("alpha").unwrap();
    assert!(state.activated_at.is_some());
    assert!(state.last_error.is_none());

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_activations_spawn_once() {
    let h = Harness::new();
    let (a, b) = tokio::join!(h.supervisor.activate("alpha"), h.supervisor.activate("alpha"));
    assert!(!a.is_error && !b.is_error);
    assert_eq!(h.spawns("alpha"), 1);
    assert_eq!(h.tool_names(), vec!["alpha_ping"]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_cold_route_activates_once() {
    let h = Harness::new();

    let result = h.router.route("alpha_ping", Map::new()).await;
    assert!(!result.is_error, "{}", result.text_content());
    assert_eq!(result.text_content(), "alpha says hi");
    assert_eq!(h.supervisor.state("alpha").unwrap().status, WorkerStatus::Active);

    let result = h.router.route("alpha_ping", Map::new()).await;
    assert_eq!(result.text_content(), "alpha says hi");
    assert_eq!(h.spawns("alpha"), 1);

    // Active worker, tool that does not exist: no second activation.
    let result = h.router.route("alpha_missing", Map::new()).await;
    assert!(result.is_error);
    assert_eq!(result.text_content(), "Unknown tool: alpha_missing");
    assert_eq!(h.spawns("alpha"), 1);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_cold_route_to_missing_tool_reports_activation() {
    let h = Harness::new();

    let result = h.router.route("alpha_missing", Map::new()).await;
    assert!(result.is_error);
    assert_eq!(
        result.text_content(),
        "Unknown tool: alpha_missing (alpha was activated to look it up; it exposes: alpha_ping)"
    );
    assert_eq!(h.supervisor.state("alpha").unwrap().status, WorkerStatus::Active);
    assert_eq!(h.spawns("alpha"), 1);
    assert_eq!(h.supervisor.state("beta").unwrap().status, WorkerStatus::Inactive);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_moves_worker_to_error() {
    let h = Harness::new();
    h.supervisor.activate("alpha").await;
    h.supervisor.activate("beta").await;
    let mut changes = h.supervisor.subscribe();

    let mut crash = Map::new();
    crash.insert("text".into(), json!("crash"));
    let result = h.router.route("alpha_ping", crash).await;
    assert!(result.is_error);
    assert!(result.text_content().contains("alpha"), "{}", result.text_content());

    h.wait_for_status("alpha", WorkerStatus::Error).await;
    let state = h.supervisor.state("alpha").unwrap();
    assert_eq!(state.last_error.as_deref(), Some("process exited unexpectedly"));
    assert!(state.tools.is_empty());
    assert!(h.supervisor.resolve("alpha_ping").is_none());
    assert_eq!(h.tool_names(), vec!["beta_echo"]);
    assert_eq!(changes.recv().await.unwrap(), ToolsChanged);

    let health = h.supervisor.health().await.text_content();
    assert!(health.contains("alpha: error (process exited unexpectedly)"), "{health}");

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_deactivate_does_not_look_like_crash() {
    let h = Harness::new();
    h.supervisor.activate("alpha").await;
    h.supervisor.deactivate("alpha").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = h.supervisor.state("alpha").unwrap();
    assert_eq!(state.status, WorkerStatus::Inactive);
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn test_reload_spawns_fresh_process() {
    let h = Harness::new();
    h.supervisor.activate("alpha").await;
    let first_pid = h.supervisor.session("alpha").unwrap().pid();

    let result = h.supervisor.reload("alpha").await;
    assert!(!result.is_error, "{}", result.text_content());
    let second_pid = h.supervisor.session("alpha").unwrap().pid();

    assert_ne!(first_pid, second_pid);
    assert_eq!(h.spawns("alpha"), 2);
    assert_eq!(h.tool_names(), vec!["alpha_ping"]);

    // Restart on an inactive worker still ends up active.
    h.supervisor.deactivate("alpha").await;
    let result = h.supervisor.restart("alpha").await;
    assert!(!result.is_error);
    assert_eq!(h.supervisor.state("alpha").unwrap().status, WorkerStatus::Active);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_health_and_services_reports() {
    let h = Harness::new();
    h.supervisor.activate("alpha").await;
    let pid = h.supervisor.session("alpha").unwrap().pid().unwrap();

    let health = h.supervisor.health().await.text_content();
    assert!(health.contains(&format!("alpha: healthy (pid: {pid})")), "{health}");
    assert!(health.contains("beta: inactive"), "{health}");

    let services = h.supervisor.services().text_content();
    let lines: Vec<&str> = services.lines().collect();
    assert!(lines[0].starts_with("alpha: active | tools: 1 | uptime: "), "{services}");
    assert_eq!(lines[1], "beta: inactive | tools: 0 | uptime: -");

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_remove_active_worker_persists() {
    let dir = tempfile::tempdir().unwrap();
    let spawn_log = dir.path().join("spawns.log");
    let path = dir.path().join("gateway.config.json");
    let store = FileConfigStore::new(&path);
    store
        .save(&GatewayConfig {
            services: vec![worker("alpha", "ping", &spawn_log)],
        })
        .unwrap();

    let config = store.load().unwrap();
    let supervisor = WorkerSupervisor::new(config.services, Arc::new(FileConfigStore::new(&path)));
    supervisor.activate("alpha").await;

    let result = supervisor.remove("alpha").await;
    assert!(!result.is_error, "{}", result.text_content());
    assert!(supervisor.all_tools().is_empty());
    assert!(!supervisor.is_configured("alpha"));
    assert!(store.load().unwrap().services.is_empty());
}

#[tokio::test]
async fn test_server_publishes_worker_tools() {
    let h = Harness::new();
    let server = GatewayServer::new(Arc::clone(&h.supervisor));

    let call = server
        .handle_request(
            "tools/call",
            Some(json!({"name": "activate", "arguments": {"name": "beta"}})),
        )
        .await
        .unwrap();
    assert!(call.get("isError").is_none());

    let listed = server.handle_request("tools/list", None).await.unwrap();
    let names: Vec<&str> = listed["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names.len(), 10);
    assert_eq!(names.last(), Some(&"beta_echo"));

    let call = server
        .handle_request("tools/call", Some(json!({"name": "beta_echo", "arguments": {}})))
        .await
        .unwrap();
    assert_eq!(call["content"][0]["text"], "beta says hi");

    h.supervisor.shutdown().await;
}
