//! Environment-driven settings for the engine, plus the optional
//! multi-backend router config file (see `relay-backend::router`).

use serde::Deserialize;
use std::env;

/// Snapshot of configuration consumed once at engine construction.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub model_id: String,
    pub backends: Vec<String>,
    pub batch_size: usize,
    pub batch_wait_ms: u64,
    pub metrics_max_items: usize,
    pub total_layers: i64,
    pub pretty_json: bool,
    pub pretty_default: bool,
    pub router_config_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            model_id: "relay-gguf".to_string(),
            backends: Vec::new(),
            batch_size: 4,
            batch_wait_ms: 10,
            metrics_max_items: 1000,
            total_layers: 32,
            pretty_json: false,
            pretty_default: true,
            router_config_path: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("RELAYSERVE_PORT") { cfg.port = v; }
        if let Ok(v) = env::var("RELAYSERVE_MODEL_ID") { cfg.model_id = v; }
        if let Ok(v) = env::var("RELAYSERVE_BACKENDS") {
            cfg.backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_parse("RELAYSERVE_BATCH_SIZE") { cfg.batch_size = v; }
        if let Some(v) = env_parse("RELAYSERVE_BATCH_WAIT_MS") { cfg.batch_wait_ms = v; }
        if let Some(v) = env_parse("RELAYSERVE_METRICS_MAX_ITEMS") { cfg.metrics_max_items = v; }
        if let Some(v) = env_parse("RELAYSERVE_TOTAL_LAYERS") { cfg.total_layers = v; }
        if let Ok(v) = env::var("RELAYSERVE_PRETTY_JSON") { cfg.pretty_json = v == "1"; }
        if let Ok(v) = env::var("RELAYSERVE_PRETTY_DEFAULT") { cfg.pretty_default = v == "1"; }
        if let Ok(v) = env::var("RELAYSERVE_ROUTER_CONFIG") { cfg.router_config_path = Some(v); }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Config file shape for the optional named multi-backend router.
/// Loaded from YAML, not from the env.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub default_backend: Option<String>,
    pub backends: std::collections::HashMap<String, RouterBackendEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterBackendEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl RouterConfig {
    pub fn load(path: &str) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_yaml::from_str(&text).ok()
    }
}
