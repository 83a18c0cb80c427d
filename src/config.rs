//! Session configuration: JSON files with a user overlay, plus env overrides.
//!
//! Mirrors the layout the desktop client uses: a default config file shipped
//! with the install and an optional user file merged over it. Credentials are
//! deliberately not part of this surface; the token is passed to
//! `WarpSession::new` directly.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
// Matches the 2 second listener join the desktop client has always used.
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket endpoint of the terminal-control service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// How long `connect` waits for the handshake before giving up.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long `disconnect` waits for the listener task to exit before
    /// forcing release of the connection.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a single JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("invalid config JSON in {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Load the default config and merge the user config over it, if one
    /// exists. Keys present in the user file win; nested objects merge.
    pub fn load_with_overlay<P: AsRef<Path>, Q: AsRef<Path>>(
        default_path: P,
        user_path: Q,
    ) -> Result<Self> {
        let content = std::fs::read_to_string(default_path.as_ref()).with_context(|| {
            format!("failed to read config {}", default_path.as_ref().display())
        })?;
        let mut base: Value =
            serde_json::from_str(&content).context("invalid default config JSON")?;

        if user_path.as_ref().exists() {
            let user_content = std::fs::read_to_string(user_path.as_ref())
                .with_context(|| format!("failed to read {}", user_path.as_ref().display()))?;
            let overlay: Value =
                serde_json::from_str(&user_content).context("invalid user config JSON")?;
            merge_values(&mut base, overlay);
        }

        let config = serde_json::from_value(base).context("config failed validation")?;
        Ok(config)
    }

    /// Apply environment overrides. `WARP_ENDPOINT` replaces the configured
    /// endpoint when set.
    pub fn apply_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("WARP_ENDPOINT") {
            if !endpoint.is_empty() {
                self.endpoint = endpoint;
            }
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
