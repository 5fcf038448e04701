// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus transport configuration
//!
//! Selects and parameterizes the server transport: plain TCP by default, or
//! an RTU serial line when `path` is set.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for the Modbus server transport.
///
/// # Fields
///
/// * `address` - Network address the TCP server binds to (default: 0.0.0.0)
/// * `port` - TCP port number (default: 502, the standard Modbus port)
/// * `path` - Serial device path; setting it switches the gateway to RTU
/// * `baud_rate` - Serial line speed (default: 9600)
/// * `parity` - Serial parity, one of `N`, `E`, `O` (default: N)
/// * `data_bits` - Serial data bits, 5 to 8 (default: 8)
/// * `stop_bits` - Serial stop bits, 1 or 2 (default: 1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_parity")]
    pub parity: String,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl ModbusConfig {
    /// True when the gateway should serve RTU over a serial line.
    pub fn is_rtu(&self) -> bool {
        self.path.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Invalid Modbus port number: {}", self.port);
        }
        if !matches!(self.parity.as_str(), "N" | "E" | "O") {
            anyhow::bail!("Invalid parity '{}', expected N, E or O", self.parity);
        }
        if !(5..=8).contains(&self.data_bits) {
            anyhow::bail!("Invalid data bits: {}", self.data_bits);
        }
        if !(1..=2).contains(&self.stop_bits) {
            anyhow::bail!("Invalid stop bits: {}", self.stop_bits);
        }
        Ok(())
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            path: None,
            baud_rate: default_baud_rate(),
            parity: default_parity(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}
