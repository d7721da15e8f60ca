//! Wisp server configuration

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use wisp_mux::{SessionConfig, ThrottleConfig};

/// Environment variable naming an optional JSON config file
pub const CONFIG_ENV: &str = "WISP_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Throttling extension settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ThrottleSettings {
    /// Bytes a stream may move per interval
    pub limit_bytes: u64,
    pub interval_ms: u64,
}

/// Configuration for the Wisp proxy server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WispConfig {
    /// Allow UDP streams (and advertise the UDP extension)
    pub allow_udp: bool,
    /// Allow TCP streams
    pub allow_tcp: bool,
    /// Allow connections to loopback addresses
    pub allow_loopback: bool,
    /// Allow connections to private/non-global IPs
    pub allow_private: bool,
    /// Buffer size for stream copying
    pub buffer_size: usize,
    /// Blocked ports
    pub blocked_ports: Vec<RangeInclusive<u16>>,
    /// DNS servers to use (empty = system default)
    pub dns_servers: Vec<String>,
    /// How long a client has to send its INFO before it is treated as legacy
    pub handshake_timeout_ms: u64,
    /// Credit granted per CONTINUE
    pub initial_credit: u32,
    pub throttle: Option<ThrottleSettings>,
    /// Username -> password. Setting this requires clients to authenticate.
    pub auth_users: Option<HashMap<String, String>>,
    /// WebSocket keep-alive ping interval
    pub ping_interval_secs: u64,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for WispConfig {
    fn default() -> Self {
        Self {
            allow_udp: true,
            allow_tcp: true,
            allow_loopback: false,
            allow_private: true,
            buffer_size: 16384,
            blocked_ports: vec![
                // Common blocked ports for security
                22..=22,   // SSH
                25..=25,   // SMTP
                587..=587, // SMTP submission
            ],
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            handshake_timeout_ms: 5000,
            initial_credit: wisp_mux::packet::DEFAULT_CREDIT,
            throttle: None,
            auth_users: None,
            ping_interval_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl WispConfig {
    /// Load from the file named by `WISP_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check if a port is blocked
    pub fn is_port_blocked(&self, port: u16) -> bool {
        self.blocked_ports.iter().any(|range| range.contains(&port))
    }

    /// Per-connection settings handed to each session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            initial_credit: self.initial_credit,
            allow_udp: self.allow_udp,
            throttle: self.throttle.map(|t| ThrottleConfig {
                limit_bytes: t.limit_bytes,
                interval: Duration::from_millis(t.interval_ms),
            }),
            buffer_size: self.buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: WispConfig = serde_json::from_str(
            r#"{
                "allow_udp": false,
                "blocked_ports": [{ "start": 8000, "end": 8080 }],
                "throttle": { "limit_bytes": 1000, "interval_ms": 1000 },
                "auth_users": { "alice": "hunter2" }
            }"#,
        )
        .unwrap();

        assert!(!config.allow_udp);
        assert!(config.allow_tcp);
        assert!(config.is_port_blocked(8040));
        assert!(!config.is_port_blocked(22));
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.auth_users.unwrap()["alice"], "hunter2");
    }

    #[test]
    fn session_config_carries_protocol_knobs() {
        let config = WispConfig {
            allow_udp: false,
            handshake_timeout_ms: 250,
            throttle: Some(ThrottleSettings {
                limit_bytes: 1000,
                interval_ms: 1000,
            }),
            ..Default::default()
        };
        let session = config.session_config();

        assert!(!session.allow_udp);
        assert_eq!(session.handshake_timeout, Duration::from_millis(250));
        assert_eq!(session.initial_credit, 127);
        assert_eq!(
            session.throttle,
            Some(ThrottleConfig {
                limit_bytes: 1000,
                interval: Duration::from_secs(1),
            })
        );
    }

    #[test]
    fn unreadable_file_is_reported() {
        let err = WispConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
