// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Gateway configuration
//!
//! Configuration is loaded from a YAML file, checked against the embedded
//! JSON schema and then deserialized into typed structures with serde
//! defaults for every optional field. Command line switches may override a
//! few fields afterwards via [`Config::apply_overrides`].

pub mod modbus;
pub mod redis;
pub mod registers;
pub mod utils;

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

pub use modbus::ModbusConfig;
pub use redis::RedisConfig;
pub use registers::{PointConfig, RegisterFormat, RegistersConfig};
pub use utils::output_config_schema;

/// Root configuration of the gateway.
///
/// # Fields
///
/// * `modbus` - Transport settings: TCP bind address/port or serial line
/// * `redis` - Pub/sub server connection
/// * `registers` - The data points exposed as Modbus cells
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub registers: RegistersConfig,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// The file is parsed as YAML, validated against the embedded JSON
    /// schema and then checked against the rules the schema cannot express.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let yaml_value: serde_yml::Value =
            serde_yml::from_str(&content).context("Failed to parse YAML configuration")?;
        let json_value = serde_json::to_value(&yaml_value)
            .context("Failed to convert YAML configuration to JSON")?;
        utils::validate_against_schema(&json_value)?;
        let config: Config =
            serde_json::from_value(json_value).context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the rules the JSON schema cannot express.
    pub fn validate(&self) -> Result<()> {
        self.modbus.validate()?;
        self.registers.validate()?;
        Ok(())
    }

    /// Applies command line overrides on top of the file contents.
    pub fn apply_overrides(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        redis_url: Option<&str>,
    ) {
        if let Some(host) = host {
            self.modbus.address = host.to_string();
        }
        if let Some(port) = port {
            self.modbus.port = port;
        }
        if let Some(url) = redis_url {
            self.redis.url = url.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let file = write_config(
            r#"
registers:
  holdings:
    - topic: devices/test/temperature
      address: 0
"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/");
        let point = &config.registers.holdings[0];
        assert!(point.enabled);
        assert_eq!(point.unit_id, 1);
        assert_eq!(point.format, RegisterFormat::Unsigned);
        assert_eq!(point.scale, 1.0);
    }

    #[test]
    fn schema_rejects_unknown_format() {
        let file = write_config(
            r#"
registers:
  holdings:
    - topic: devices/test/temperature
      address: 0
      format: complex
"#,
        );
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("schema"), "{}", err);
    }

    #[test]
    fn bad_parity_is_rejected() {
        let file = write_config(
            r#"
modbus:
  path: /dev/ttyRS485
  parity: Q
registers:
  coils:
    - topic: devices/test/relay
      address: 0
"#,
        );
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = Config::default();
        config.apply_overrides(Some("10.0.0.1"), Some(1502), Some("redis://cache:6379/"));
        assert_eq!(config.modbus.address, "10.0.0.1");
        assert_eq!(config.modbus.port, 1502);
        assert_eq!(config.redis.url, "redis://cache:6379/");
    }
}
