//! Gateway configuration loading, validation and persistence.
//!
//! The worker list lives in `gateway.config.json` (or `.yaml`). `add`/`remove`
//! re-read it through a [`ConfigStore`] on every call, so edits made while
//! the gateway runs are respected. Concurrent writers are last-write-wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::errors::GatewayError;
use super::registry::NAMESPACE_SEPARATOR;
use super::types::{GatewayConfig, WorkerConfig};

/// Default config file name, looked up in the working directory first.
pub const DEFAULT_CONFIG_FILE: &str = "gateway.config.json";

// ─── Store ───────────────────────────────────────────────────────────────────

/// Persistence for the worker list.
///
/// `load` must read fresh state on every call; nothing is cached.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<GatewayConfig, GatewayError>;
    fn save(&self, config: &GatewayConfig) -> Result<(), GatewayError>;
}

/// Serialization format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// File-backed store (JSON or YAML).
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<GatewayConfig, GatewayError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| GatewayError::ConfigStore {
            reason: format!("failed to read {}: {e}", self.path.display()),
        })?;
        let config = parse_config(&raw, ConfigFormat::for_path(&self.path))?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Write via a sibling temp file and rename, so readers never see a
    /// half-written file.
    fn save(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let body = match ConfigFormat::for_path(&self.path) {
            ConfigFormat::Json => serde_json::to_string_pretty(config)
                .map(|mut s| {
                    s.push('\n');
                    s
                })
                .map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(|e| e.to_string()),
        }
        .map_err(|reason| GatewayError::ConfigStore {
            reason: format!("failed to serialize config: {reason}"),
        })?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(|e| GatewayError::ConfigStore {
            reason: format!("failed to write {}: {e}", tmp.display()),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| GatewayError::ConfigStore {
            reason: format!("failed to replace {}: {e}", self.path.display()),
        })?;

        tracing::info!(
            path = %self.path.display(),
            services = config.services.len(),
            "saved gateway config"
        );
        Ok(())
    }
}

/// In-memory store, used when nothing should touch disk.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<GatewayConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Current contents.
    pub fn snapshot(&self) -> GatewayConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<GatewayConfig, GatewayError> {
        Ok(self.snapshot())
    }

    fn save(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }
}

fn parse_config(raw: &str, format: ConfigFormat) -> Result<GatewayConfig, GatewayError> {
    let parsed = match format {
        ConfigFormat::Json => serde_json::from_str::<GatewayConfig>(raw).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::from_str::<GatewayConfig>(raw).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| GatewayError::InvalidConfig {
        reason: format!("failed to parse config: {reason}"),
    })
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Check a worker name. The namespace separator is reserved so that
/// `{worker}_{tool}` can never be produced by two different pairs.
pub fn validate_worker_name(name: &str) -> Result<(), GatewayError> {
    if name.trim().is_empty() {
        return Err(GatewayError::InvalidConfig {
            reason: "service name must not be empty".into(),
        });
    }
    if name.contains(NAMESPACE_SEPARATOR) {
        return Err(GatewayError::InvalidConfig {
            reason: format!("service name '{name}' must not contain '{NAMESPACE_SEPARATOR}'"),
        });
    }
    Ok(())
}

/// Validate a single worker definition.
pub fn validate_worker(worker: &WorkerConfig) -> Result<(), GatewayError> {
    validate_worker_name(&worker.name)?;
    if worker.command.trim().is_empty() {
        return Err(GatewayError::InvalidConfig {
            reason: format!("service '{}' has an empty command", worker.name),
        });
    }
    Ok(())
}

/// Validate a whole config: every entry valid, names unique.
pub fn validate_config(config: &GatewayConfig) -> Result<(), GatewayError> {
    let mut seen = std::collections::HashSet::new();
    for worker in &config.services {
        validate_worker(worker)?;
        if !seen.insert(worker.name.as_str()) {
            return Err(GatewayError::InvalidConfig {
                reason: format!("duplicate service name '{}'", worker.name),
            });
        }
    }
    Ok(())
}

// ─── Paths & .env ────────────────────────────────────────────────────────────

/// Resolve the config file path.
///
/// Resolution order: explicit path, `gateway.config.json` in the working
/// directory, then `<config_dir>/mcphub/gateway.config.json`. When nothing
/// exists the working-directory path is returned so the error names it.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let local = std::env::current_dir()
        .unwrap_or_default()
        .join(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("mcphub").join(DEFAULT_CONFIG_FILE);
        if candidate.exists() {
            return candidate;
        }
    }

    local
}

/// Load `.env` from the config file's directory into the process
/// environment. Variables that are already set keep their values.
///
/// Returns the path that was loaded, if any.
pub fn load_dotenv(config_path: &Path) -> Option<PathBuf> {
    let dir = config_path.parent().filter(|p| !p.as_os_str().is_empty())?;
    let env_path = dir.join(".env");
    if !env_path.is_file() {
        return None;
    }
    match dotenvy::from_path(&env_path) {
        Ok(()) => Some(env_path),
        Err(e) => {
            tracing::warn!(path = %env_path.display(), error = %e, "failed to load .env");
            None
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Resolve a worker's environment overlay against the gateway's own
/// environment.
pub fn resolve_env(overlay: &HashMap<String, String>) -> HashMap<String, String> {
    let ambient = |name: &str| std::env::var(name).ok();
    overlay
        .iter()
        .map(|(key, value)| (key.clone(), expand_env_refs(value, ambient)))
        .collect()
}

/// Expand `${VAR}` and `${VAR:-default}` references in an overlay value.
///
/// Unset variables without a default expand to nothing. A leading `~` in a
/// default is the home directory. An unterminated `${` is kept as written.
pub fn expand_env_refs(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        let Some(close) = rest[open + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let reference = &rest[open + 2..open + 2 + close];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match (lookup(name), default) {
            (Some(found), _) => out.push_str(&found),
            (None, Some(default)) => out.push_str(&home_relative(default)),
            (None, None) => {}
        }
        rest = &rest[open + 2 + close + 1..];
    }

    out.push_str(rest);
    out
}

fn home_relative(default: &str) -> String {
    match (default.strip_prefix('~'), dirs::home_dir()) {
        (Some(tail), Some(home)) => format!("{}{tail}", home.display()),
        _ => default.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GatewayConfig {
        GatewayConfig {
            services: vec![
                WorkerConfig::new("alpha", "node", vec!["alpha.js".into()]),
                WorkerConfig::new("beta", "npx", vec![]),
            ],
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_expand_env_refs_defaults() {
        let lookup = vars(&[]);
        assert_eq!(expand_env_refs("${MISSING:-/fallback}", &lookup), "/fallback");
        assert_eq!(expand_env_refs("a${MISSING}b", &lookup), "ab");

        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_env_refs("${MISSING:-~/cache}", &lookup),
            format!("{}/cache", home.display())
        );
    }

    #[test]
    fn test_expand_env_refs_values() {
        let lookup = vars(&[("TOKEN", "s3cret"), ("REGION", "eu")]);
        assert_eq!(expand_env_refs("Bearer ${TOKEN}", &lookup), "Bearer s3cret");
        assert_eq!(
            expand_env_refs("${REGION:-us}-${TOKEN}", &lookup),
            "eu-s3cret"
        );
    }

    #[test]
    fn test_expand_env_refs_leaves_other_text() {
        let lookup = vars(&[("HOME", "/home/x")]);
        assert_eq!(expand_env_refs("plain $HOME text", &lookup), "plain $HOME text");
        assert_eq!(expand_env_refs("open ${HOME", &lookup), "open ${HOME");
    }

    #[test]
    fn test_resolve_env_reads_process_environment() {
        std::env::set_var("__MCPHUB_TEST_TOKEN__", "s3cret");
        let overlay = HashMap::from([(
            "AUTH".to_string(),
            "Bearer ${__MCPHUB_TEST_TOKEN__}".to_string(),
        )]);
        let resolved = resolve_env(&overlay);
        std::env::remove_var("__MCPHUB_TEST_TOKEN__");
        assert_eq!(resolved["AUTH"], "Bearer s3cret");
    }

    #[test]
    fn test_validate_rejects_separator_in_name() {
        let err = validate_worker_name("my_worker").unwrap_err();
        assert!(err.to_string().contains("must not contain '_'"));
        assert!(validate_worker_name("my-worker").is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty_command() {
        let mut config = sample();
        config.services.push(WorkerConfig::new("alpha", "node", vec![]));
        assert!(validate_config(&config).is_err());

        let config = GatewayConfig {
            services: vec![WorkerConfig::new("gamma", "  ", vec![])],
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_file_store_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("gateway.config.json"));
        store.save(&sample()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"autoActivate\": false"));
        assert_eq!(store.load().unwrap(), sample());
        assert!(!dir.path().join("gateway.config.tmp").exists());
    }

    #[test]
    fn test_file_store_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "services:\n  - name: alpha\n    command: node\n    autoActivate: true\n",
        )
        .unwrap();
        let config = FileConfigStore::new(&path).load().unwrap();
        assert_eq!(config.services.len(), 1);
        assert!(config.services[0].auto_activate);
    }

    #[test]
    fn test_file_store_reads_fresh_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.config.json");
        let store = FileConfigStore::new(&path);
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap().services.len(), 2);

        std::fs::write(&path, r#"{"services": []}"#).unwrap();
        assert!(store.load().unwrap().services.is_empty());
    }

    #[test]
    fn test_file_store_missing_services_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.config.json");
        std::fs::write(&path, r#"{"workers": []}"#).unwrap();
        let err = FileConfigStore::new(&path).load().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig { .. }));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryConfigStore::new(sample());
        let mut config = store.load().unwrap();
        config.services.pop();
        store.save(&config).unwrap();
        assert_eq!(store.snapshot().services.len(), 1);
    }

    #[test]
    fn test_load_dotenv_does_not_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "__MCPHUB_DOTENV_NEW__=from-file\n__MCPHUB_DOTENV_SET__=from-file\n",
        )
        .unwrap();
        std::env::set_var("__MCPHUB_DOTENV_SET__", "from-env");

        let loaded = load_dotenv(&dir.path().join(DEFAULT_CONFIG_FILE));
        assert!(loaded.is_some());
        assert_eq!(std::env::var("__MCPHUB_DOTENV_NEW__").unwrap(), "from-file");
        assert_eq!(std::env::var("__MCPHUB_DOTENV_SET__").unwrap(), "from-env");

        std::env::remove_var("__MCPHUB_DOTENV_NEW__");
        std::env::remove_var("__MCPHUB_DOTENV_SET__");
    }

    #[test]
    fn test_resolve_config_path_explicit_wins() {
        let path = Path::new("/etc/mcphub/custom.yaml");
        assert_eq!(resolve_config_path(Some(path)), path);
    }
}
