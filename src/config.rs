//! Runtime configuration (SPEC_FULL.md §3.2), grounded on the base crate's
//! `Config`/`ServerConfig` (`firework::config`): a TOML file loaded once at
//! startup and held behind a `OnceLock`, rather than threaded through every
//! constructor. This is ambient infrastructure the dispatch core reads
//! (the `url()` builder's base URLs, a route's default timeout before
//! per-route overrides) — it is not itself one of spec.md's components.

use crate::host::UrlTable;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: default_address(),
            port: default_port(),
        }
    }
}

/// The base URLs a deployed instance is reachable at, installed once at
/// process start (spec.md §6 "URL table"). Distinct from `UrlTable` only in
/// that this one is `Deserialize`; `RuntimeConfig::urls` converts it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlsConfig {
    pub http: Option<String>,
    pub ws: Option<String>,
}

/// Default timeouts applied before a route/queue/websocket's own `config`
/// overrides and the manifest's clamping (spec.md §4.B.6, `manifest::clamp`).
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_http_timeout")]
    pub http: u64,
    #[serde(default = "default_queue_timeout")]
    pub queue: u64,
    #[serde(default = "default_ws_timeout")]
    pub websocket: u64,
}

fn default_http_timeout() -> u64 {
    crate::manifest::DEFAULT_HTTP_TIMEOUT
}

fn default_queue_timeout() -> u64 {
    crate::manifest::DEFAULT_QUEUE_TIMEOUT
}

fn default_ws_timeout() -> u64 {
    crate::manifest::DEFAULT_WS_TIMEOUT
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            http: default_http_timeout(),
            queue: default_queue_timeout(),
            websocket: default_ws_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub urls: UrlsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Directory `host::static_files` serves from, if the deployment wires
    /// a static fallback route in front of the dispatch core
    /// (SPEC_FULL.md §5).
    #[serde(default)]
    pub static_root: Option<String>,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<RuntimeConfig, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Tries `Kindling.toml` then `kindling.toml`, falling back to defaults
    /// with a logged notice either way (SPEC_FULL.md §3.2).
    pub fn load_default() -> RuntimeConfig {
        for candidate in ["Kindling.toml", "kindling.toml"] {
            if Path::new(candidate).exists() {
                match RuntimeConfig::from_file(candidate) {
                    Ok(config) => {
                        log::info!("loaded configuration from {}", candidate);
                        return config;
                    }
                    Err(e) => log::error!("failed to parse {}: {}", candidate, e),
                }
            }
        }
        log::info!("no Kindling.toml found, using default configuration");
        RuntimeConfig::default()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen.address, self.listen.port)
    }

    pub fn url_table(&self) -> UrlTable {
        UrlTable {
            http: self.urls.http.clone(),
            ws: self.urls.ws.clone(),
        }
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// The process-wide configuration, lazily loaded on first access and fixed
/// thereafter (SPEC_FULL.md §3.2). Most callers want this; `init` exists
/// only for a host adapter that needs to load a non-default path before
/// anything else touches configuration.
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::load_default)
}

/// Installs an explicit configuration, for hosts that load from a
/// non-default path or for tests that want deterministic values. Returns
/// `Err` with the already-installed config if called more than once —
/// same one-shot discipline as the ambient user cell
/// (`context::set_user`).
pub fn init(config: RuntimeConfig) -> std::result::Result<(), RuntimeConfig> {
    CONFIG.set(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_to_localhost_8080() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn parses_a_minimal_toml_document() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [listen]
            port = 3000

            [urls]
            http = "https://example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.port, 3000);
        assert_eq!(config.urls.http.as_deref(), Some("https://example.com"));
        assert_eq!(config.timeouts.http, crate::manifest::DEFAULT_HTTP_TIMEOUT);
    }
}
