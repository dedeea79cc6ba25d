//! gwsrv configuration
//!
//! Loaded through `common::config`: built-in defaults, then an optional
//! YAML/TOML/JSON file, then `GWSRV_` environment variables
//! (`GWSRV_MQTT__HOST=broker.local`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use voltage_iogw::{SessionConfig, TopicTemplate, ValidatorConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "GWSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// 0, 1 or 2
    pub qos: u8,
    /// Request channel capacity between client handles and the event loop
    pub channel_capacity: usize,
    /// Pause before polling again after a connection error
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "gwsrv".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            qos: 1,
            channel_capacity: 64,
            reconnect_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Device to service
    pub uplink: TopicTemplate,
    /// Service to device
    pub downlink: TopicTemplate,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            uplink: TopicTemplate::around("gw/", "/up"),
            downlink: TopicTemplate::around("gw/", "/down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub response_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            auth_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        SessionConfig {
            response_timeout: Duration::from_millis(s.response_timeout_ms),
            auth_timeout: Duration::from_millis(s.auth_timeout_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily rolling files go here when set
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttConfig,
    pub topics: TopicsConfig,
    pub session: SessionSettings,
    pub validation: ValidatorConfig,
    /// Per-device settings keyed by device id
    pub devices: BTreeMap<String, DeviceConfig>,
    /// Password for devices without their own
    pub default_password: Option<String>,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        common::load_config(path, ENV_PREFIX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            bail!("mqtt.host must not be empty");
        }
        if self.mqtt.qos > 2 {
            bail!("mqtt.qos must be 0, 1 or 2, got {}", self.mqtt.qos);
        }
        if self.mqtt.keep_alive_secs < 5 {
            bail!("mqtt.keep_alive_secs must be at least 5");
        }
        if self.mqtt.channel_capacity == 0 {
            bail!("mqtt.channel_capacity must be positive");
        }
        let s = &self.session;
        if s.response_timeout_ms == 0 || s.auth_timeout_ms == 0 || s.sweep_interval_ms == 0 {
            bail!("session timeouts and sweep interval must be positive");
        }
        if self.validation.signal_min > self.validation.signal_max {
            bail!(
                "validation.signal_min {} exceeds signal_max {}",
                self.validation.signal_min,
                self.validation.signal_max
            );
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.session)
    }

    /// Subscription filter covering every device's uplink
    pub fn subscribe_filter(&self) -> String {
        self.topics.uplink.wildcard()
    }

    pub fn log_config(&self, service_name: &str) -> common::LogConfig {
        common::LogConfig {
            service_name: service_name.to_string(),
            level: self.logging.level.clone(),
            log_dir: self.logging.dir.clone(),
            enable_json: self.logging.json,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.subscribe_filter(), "gw/+/up");
        assert_eq!(
            config.session_config().response_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gwsrv.yaml");
        std::fs::write(
            &path,
            r#"
mqtt:
  host: broker.local
  qos: 0
topics:
  uplink: "iogw/{device_id}/data"
session:
  response_timeout_ms: 3000
validation:
  signal_max: 30
devices:
  GW-0001:
    password: "654321"
default_password: "123456"
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 0);
        assert_eq!(config.subscribe_filter(), "iogw/+/data");
        assert_eq!(config.topics.downlink.render("x"), "gw/x/down");
        assert_eq!(config.session.response_timeout_ms, 3000);
        assert_eq!(config.session.auth_timeout_ms, 10_000);
        assert_eq!(config.validation.signal_max, 30);
        assert_eq!(
            config.devices["GW-0001"].password.as_deref(),
            Some("654321")
        );
        assert_eq!(config.default_password.as_deref(), Some("123456"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_topic_rejected_at_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gwsrv.yaml");
        std::fs::write(&path, "topics:\n  uplink: \"gw/up\"\n").unwrap();
        assert!(GatewayConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.session.auth_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.validation.signal_min = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_config_mapping() {
        let mut config = GatewayConfig::default();
        config.logging.level = "debug".to_string();
        config.logging.json = true;
        let log = config.log_config("gwsrv");
        assert_eq!(log.service_name, "gwsrv");
        assert_eq!(log.level, "debug");
        assert!(log.enable_json);
        assert!(log.log_dir.is_none());
    }
}
