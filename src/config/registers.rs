// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Data point configuration
//!
//! Each point maps one pub/sub topic to a Modbus address span on one slave.
//! Bit stores (coils, discrete inputs) ignore the word-store fields; word
//! stores pick a value encoding via `format`, `size`, `scale` and the swap
//! flags.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Value encoding of a word-store point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    Signed,
    #[default]
    Unsigned,
    /// Binary-coded decimal.
    Bcd,
    /// IEEE 754, 4 or 8 bytes.
    Float,
    /// Text, one character per register; `size` is the register count.
    Varchar,
}

/// One exposed data point.
///
/// # Fields
///
/// * `enabled` - Disabled points are skipped entirely (default: true)
/// * `topic` - Pub/sub topic; writes are echoed to `<topic>/on`
/// * `unit_id` - Modbus slave id the point lives on (default: 1)
/// * `address` - First cell address inside the store
/// * `format` - Value encoding, word stores only (default: unsigned)
/// * `size` - Value width in bytes, or register count for varchar
/// * `scale` - Fixed-point divisor for integer formats (default: 1.0)
/// * `byteswap` - Swap the two bytes inside each register
/// * `wordswap` - Reverse the register order of multi-register values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub topic: String,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    pub address: i64,

    #[serde(default)]
    pub format: RegisterFormat,

    #[serde(default)]
    pub size: Option<usize>,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub byteswap: bool,

    #[serde(default)]
    pub wordswap: bool,
}

/// The four per-store point lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistersConfig {
    #[serde(default)]
    pub coils: Vec<PointConfig>,

    #[serde(default)]
    pub discretes: Vec<PointConfig>,

    #[serde(default)]
    pub holdings: Vec<PointConfig>,

    #[serde(default)]
    pub inputs: Vec<PointConfig>,
}

impl RegistersConfig {
    pub fn validate(&self) -> Result<()> {
        let lists = [
            ("coils", &self.coils),
            ("discretes", &self.discretes),
            ("holdings", &self.holdings),
            ("inputs", &self.inputs),
        ];
        for (section, points) in lists {
            for point in points {
                if point.topic.is_empty() {
                    anyhow::bail!("{}: point at address {} has no topic", section, point.address);
                }
                if point.address < 0 {
                    anyhow::bail!(
                        "{}: topic {} has a negative address {}",
                        section,
                        point.topic,
                        point.address
                    );
                }
                if point.format == RegisterFormat::Varchar && point.size.is_none() {
                    anyhow::bail!("{}: varchar topic {} needs a size", section, point.topic);
                }
            }
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_unit_id() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}
