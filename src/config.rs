// =============================================================================
// Configuration — server settings and broker connection document
// =============================================================================
//
// `ConnectionConfig` is the persisted `connection.json` document (credentials
// plus the autoconnect flag). Every field carries a serde default so older
// files keep loading after new fields appear. Saves are atomic (tmp + rename)
// to survive a crash mid-write.
//
// `ServerConfig` is process-level: bind address, port, data directory, event
// capacity. It comes from environment variables with sensible defaults and is
// validated fail-fast at startup.
// =============================================================================

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{EngineError, EngineResult};

// =============================================================================
// Connection document
// =============================================================================

fn default_api_url() -> String {
    "https://api.topstepx.com".to_string()
}

fn default_ws_url() -> String {
    "wss://rtc.topstepx.com".to_string()
}

/// Broker credentials and connection policy (`connection.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Connect to the broker on startup without an explicit API call.
    #[serde(default)]
    pub autoconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            api_key: String::new(),
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            autoconnect: false,
        }
    }
}

impl ConnectionConfig {
    /// Overlay credentials from the environment (wins over the file so
    /// secrets can stay out of the data directory).
    pub fn apply_env(&mut self) {
        if let Ok(username) = std::env::var("MERIDIAN_BROKER_USER") {
            self.username = username;
        }
        if let Ok(api_key) = std::env::var("MERIDIAN_BROKER_KEY") {
            self.api_key = api_key;
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.api_key.is_empty()
    }
}

// =============================================================================
// Server settings
// =============================================================================

/// Process-level settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 3580,
            data_dir: PathBuf::from("data"),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(port) = std::env::var("MERIDIAN_PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("MERIDIAN_PORT is not a port number: {port}"))?;
        }
        if let Ok(dir) = std::env::var("MERIDIAN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(capacity) = std::env::var("MERIDIAN_EVENT_CAPACITY") {
            config.event_capacity = capacity
                .parse()
                .with_context(|| format!("MERIDIAN_EVENT_CAPACITY is not a number: {capacity}"))?;
        }

        Ok(config)
    }

    /// Fail-fast startup checks: the engine is a localhost server and refuses
    /// to bind a public address.
    pub fn validate(&self) -> EngineResult<()> {
        let addr: IpAddr = self.bind_addr.parse().map_err(|_| {
            EngineError::Validation(format!("bind address '{}' is not an IP", self.bind_addr))
        })?;
        if !addr.is_loopback() {
            return Err(EngineError::Validation(format!(
                "bind address {addr} is not local — refusing to start"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Atomic JSON file helpers (shared with the document store)
// =============================================================================

/// Load a JSON document from `path`.
pub fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Persist a JSON document to `path` atomically (write `.tmp`, then rename).
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content =
        serde_json::to_string_pretty(value).context("failed to serialise document to JSON")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;

    info!(path = %path.display(), "document saved (atomic)");
    Ok(())
}
