use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::paths;

/// Root configuration structure for cdrun.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CdrunConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

/// All configurable defaults that can be overridden via cdrun.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default = "default_worker")]
    pub worker: WorkerConfig,

    #[serde(default = "default_dispatch")]
    pub dispatch: DispatchConfig,

    #[serde(default = "default_observer")]
    pub observer: ObserverConfig,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            worker: default_worker(),
            dispatch: default_dispatch(),
            observer: default_observer(),
        }
    }
}

/// Location of the run record store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// SQLite file; defaults to `<cdrun home>/runs.sqlite3`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// How concurrent runs on one environment are treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentPolicy {
    /// No exclusion; the environment points at whichever run wrote last.
    #[default]
    LastTriggerWins,
    /// One unfinished run per environment; later triggers fail as busy.
    Exclusive,
}

/// Configuration for the run worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Pipeline specification path, relative to the checkout root
    #[serde(default = "default_pipeline_file")]
    pub pipeline_file: String,

    /// Public console domain used to build run URLs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Variables removed from every step environment
    #[serde(default = "default_unset_envs")]
    pub unset_envs: Vec<String>,

    /// Runtime identifier -> setup command
    #[serde(default)]
    pub runtime_setup: HashMap<String, String>,

    #[serde(default)]
    pub environment_policy: EnvironmentPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawn a detached local `cdrun worker` process
    Process,
    /// POST to a function-compute style invocation endpoint
    Http,
}

/// Configuration for dispatching runs to a worker host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_service_id")]
    pub service_id: String,

    #[serde(default = "default_function_id")]
    pub function_id: String,

    /// Name of the environment variable holding the transport bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Configuration for run observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// When set, watch polls `GET {api_base_url}/application/{appId}`
    /// instead of reading the local store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Name of the environment variable holding the management API bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_worker() -> WorkerConfig {
    WorkerConfig {
        workspace_dir: None,
        log_dir: None,
        pipeline_file: default_pipeline_file(),
        domain: None,
        unset_envs: default_unset_envs(),
        runtime_setup: HashMap::new(),
        environment_policy: EnvironmentPolicy::default(),
    }
}

fn default_pipeline_file() -> String {
    "cd-pipeline.yaml".to_string()
}

fn default_unset_envs() -> Vec<String> {
    vec![
        "CDRUN_TRANSPORT_TOKEN".to_string(),
        "AWS_SECRET_ACCESS_KEY".to_string(),
        "ALIBABA_CLOUD_ACCESS_KEY_SECRET".to_string(),
        "ALIBABA_CLOUD_SECURITY_TOKEN".to_string(),
    ]
}

fn default_dispatch() -> DispatchConfig {
    DispatchConfig {
        transport: default_transport(),
        endpoint: None,
        service_id: default_service_id(),
        function_id: default_function_id(),
        access_token_env: None,
        timeout_secs: default_timeout_secs(),
    }
}

fn default_transport() -> TransportKind {
    TransportKind::Process
}

fn default_service_id() -> String {
    "cdrun".to_string()
}

fn default_function_id() -> String {
    "worker".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_observer() -> ObserverConfig {
    ObserverConfig {
        interval_ms: default_interval_ms(),
        api_base_url: None,
        access_token_env: None,
    }
}

fn default_interval_ms() -> u64 {
    5000
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load defaults, merging file config with built-in defaults.
/// If cdrun.json is missing or invalid, silently returns built-in defaults.
pub fn load_defaults() -> Defaults {
    load_config().defaults
}

/// Load the full cdrun.json config, falling back to defaults on any error.
pub fn load_config() -> CdrunConfig {
    load_config_from_file().unwrap_or_default()
}

/// Attempt to load config from cdrun.json file.
fn load_config_from_file() -> crate::Result<CdrunConfig> {
    let path = paths::cdrun_json()?;

    if !path.exists() {
        return Err(crate::Error::other("cdrun.json not found"));
    }

    let content = fs::read_to_string(&path).map_err(|e| {
        crate::Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    parse_config(&content)
}

fn parse_config(content: &str) -> crate::Result<CdrunConfig> {
    serde_json::from_str(content)
        .map_err(|e| crate::Error::config_invalid_json("cdrun.json", e))
}

/// Get the path to cdrun.json (for display purposes)
pub fn config_path() -> crate::Result<String> {
    Ok(paths::cdrun_json()?.display().to_string())
}

/// Check if cdrun.json file exists
pub fn config_exists() -> bool {
    paths::cdrun_json().map(|p| p.exists()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_builtin_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.defaults.observer.interval_ms, 5000);
        assert_eq!(config.defaults.worker.pipeline_file, "cd-pipeline.yaml");
        assert_eq!(config.defaults.dispatch.transport, TransportKind::Process);
        assert_eq!(
            config.defaults.worker.environment_policy,
            EnvironmentPolicy::LastTriggerWins
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"{"defaults": {"worker": {"environment_policy": "exclusive"}, "observer": {"interval_ms": 250}}}"#,
        )
        .unwrap();
        assert_eq!(config.defaults.observer.interval_ms, 250);
        assert_eq!(
            config.defaults.worker.environment_policy,
            EnvironmentPolicy::Exclusive
        );
        assert!(!config.defaults.worker.unset_envs.is_empty());
        assert_eq!(config.defaults.dispatch.function_id, "worker");
    }

    #[test]
    fn invalid_json_is_config_error() {
        let err = parse_config("{nope").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ConfigInvalidJson);
    }
}
