use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::connector::{ConnectorConfig, SecurityLevel, BLUETOOTH_TRANSPORT};
use crate::obex::{StreamEngine, MIN_MTU};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Exported session objects live under this path.
    pub session_base_path: String,
    /// Transport used for new sessions.
    pub transport: String,

    // RFCOMM settings
    pub security_level: SecurityLevel,
    pub connect_timeout_secs: Option<u64>,

    // OBEX settings
    pub obex_mtu: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_base_path: "/org/openobex".to_string(),
            transport: BLUETOOTH_TRANSPORT.to_string(),
            security_level: SecurityLevel::Low,
            connect_timeout_secs: None,
            obex_mtu: 4096,
        }
    }
}

impl ClientConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;

        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        info!(path = %path.display(), "client configuration loaded");
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base) = std::env::var("OBC_SESSION_BASE_PATH") {
            config.session_base_path = base;
        }
        if let Ok(transport) = std::env::var("OBC_TRANSPORT") {
            config.transport = transport;
        }
        if let Ok(level) = std::env::var("OBC_SECURITY_LEVEL") {
            match level.to_ascii_lowercase().as_str() {
                "low" => config.security_level = SecurityLevel::Low,
                "medium" => config.security_level = SecurityLevel::Medium,
                "high" => config.security_level = SecurityLevel::High,
                other => warn!(value = %other, "ignoring unknown OBC_SECURITY_LEVEL"),
            }
        }
        if let Ok(secs) = std::env::var("OBC_CONNECT_TIMEOUT_SECS") {
            if let Ok(v) = secs.parse::<u64>() {
                config.connect_timeout_secs = Some(v);
            }
        }
        if let Ok(mtu) = std::env::var("OBC_OBEX_MTU") {
            if let Ok(v) = mtu.parse::<u16>() {
                config.obex_mtu = v;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.session_base_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "session_base_path must be absolute".to_string(),
            ));
        }
        if self.session_base_path.len() > 1 && self.session_base_path.ends_with('/') {
            return Err(ConfigError::ValidationError(
                "session_base_path must not end with '/'".to_string(),
            ));
        }
        if self.transport.is_empty() {
            return Err(ConfigError::ValidationError("transport must be set".to_string()));
        }
        if self.obex_mtu < MIN_MTU {
            return Err(ConfigError::ValidationError(format!(
                "obex_mtu must be at least {MIN_MTU}"
            )));
        }
        if self.connect_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for [`crate::connector::BluetoothTransport`].
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            security: self.security_level,
            timeout: self.connect_timeout_secs.map(Duration::from_secs),
        }
    }

    /// An OBEX engine advertising the configured MTU.
    pub fn stream_engine(&self) -> StreamEngine {
        StreamEngine { mtu: self.obex_mtu }
    }
}
