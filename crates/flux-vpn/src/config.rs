//! Session Configuration
//!
//! Immutable per-session configuration handed to the host with each
//! start request. The protocol-engine payload is carried as an opaque
//! JSON string; only the DNS block and routing rules are ever inspected
//! by this crate.

use serde::{Deserialize, Serialize};

/// Default local SOCKS listener port.
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Configuration for one tunnel session.
///
/// Constructed by the caller before each start request and read-only
/// afterwards. At most one config is active at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Full protocol-engine configuration (opaque serialized JSON)
    pub config_json: String,
    /// Display name for the session (notification title)
    pub remark: String,
    /// Application name, used for the notification channel
    pub app_name: String,
    /// Icon resource reference for the ongoing notification
    pub icon: String,
    /// Subnets routed through the tunnel, as "address/prefix" strings.
    /// Empty means route everything (0.0.0.0/0).
    pub bypass_subnets: Vec<String>,
    /// Application identifiers excluded from the tunnel
    pub blocked_apps: Vec<String>,
    /// Local SOCKS port the forwarding engine connects to
    pub socks_port: u16,
    /// Query engine byte counters every tick when true
    pub enable_traffic_stats: bool,
    /// Label for the notification's disconnect action
    pub disconnect_button_label: String,
}

impl SessionConfig {
    /// Create a config with defaults for everything but the engine
    /// payload and display remark.
    pub fn new(config_json: impl Into<String>, remark: impl Into<String>) -> Self {
        Self {
            config_json: config_json.into(),
            remark: remark.into(),
            app_name: "Flux VPN".to_string(),
            icon: "ic_tunnel".to_string(),
            bypass_subnets: Vec::new(),
            blocked_apps: Vec::new(),
            socks_port: DEFAULT_SOCKS_PORT,
            enable_traffic_stats: true,
            disconnect_button_label: "Disconnect".to_string(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.config_json.trim().is_empty() {
            return Err(ConfigError::EmptyPayload);
        }
        Ok(())
    }

    /// Get the local SOCKS URL the forwarding engine bridges to.
    pub fn socks_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.socks_port)
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid SOCKS port")]
    InvalidPort,

    #[error("Engine configuration payload is empty")]
    EmptyPayload,
}
