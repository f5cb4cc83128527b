//! Configuration loading and validation

use anyhow::Result;
use regscope_link::{DeviceConfig, Protocol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub register_map: RegisterMapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Device used by `POST /api/connect` without a body and by auto-connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_device_path")]
    pub device_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    /// Overrides the register map's default slave address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_address: Option<u16>,
    /// Connect on startup
    #[serde(default)]
    pub auto_connect: bool,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            device_path: default_device_path(),
            baud_rate: None,
            slave_address: None,
            auto_connect: false,
        }
    }
}

fn default_protocol() -> Protocol {
    Protocol::I2C
}

fn default_device_path() -> String {
    "/dev/i2c-1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Use the in-memory bus instead of real hardware
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Artificial delay added to every simulated transfer
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_ms: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMapConfig {
    /// Register map JSON loaded on startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Config {
    /// Convert the `[device]` section to a connection request
    pub fn to_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            protocol: self.device.protocol,
            device_path: self.device.device_path.clone(),
            baud_rate: self.device.baud_rate,
            slave_address: self.device.slave_address,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        register_map: RegisterMapConfig {
            path: Some("./maps/demo.json".to_string()),
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("regscope.toml")).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:8080");
        assert_eq!(config.device.protocol, Protocol::I2C);
        assert!(config.simulator.enabled);
        assert!(config.register_map.path.is_none());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regscope.toml");
        std::fs::write(
            &path,
            r#"
[device]
protocol = "Serial"
device_path = "/dev/ttyUSB0"
baud_rate = 115200
slave_address = 0x51
auto_connect = true

[simulator]
latency_ms = 5
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:8080");
        assert!(config.device.auto_connect);
        assert_eq!(config.simulator.latency_ms, 5);
        assert!(config.simulator.enabled);

        let device = config.to_device_config();
        assert_eq!(device.protocol, Protocol::Serial);
        assert_eq!(device.device_path, "/dev/ttyUSB0");
        assert_eq!(device.baud_rate, Some(115200));
        assert_eq!(device.slave_address, Some(0x51));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regscope.toml");
        std::fs::write(&path, "[device]\nprotocol = \"CAN\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regscope.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.register_map.path.as_deref(), Some("./maps/demo.json"));
        assert_eq!(config.device.device_path, "/dev/i2c-1");
    }
}
