// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! Schema management for the YAML configuration: the JSON schema is embedded
//! in the binary and applied before deserialization so error messages point
//! at the offending field instead of a serde type mismatch.

use anyhow::{Context, Result};
use log::debug;

/// The embedded JSON schema the configuration file must satisfy.
pub const CONFIG_SCHEMA: &str = include_str!("../../resources/config.schema.json");

/// Output the embedded JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line. It outputs the full JSON schema for the configuration
/// to stdout, formatted for readability.
///
/// ### Example
///
/// ```bash
/// ./modbus_gateway --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).context("Failed to parse JSON schema")?;

    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;

    println!("{}", formatted_schema);

    Ok(())
}

/// Validates a parsed configuration document against the embedded schema.
pub fn validate_against_schema(instance: &serde_json::Value) -> Result<()> {
    debug!("validating configuration against the embedded schema");
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).context("Failed to parse JSON schema")?;
    let validator = jsonschema::draft202012::options()
        .should_validate_formats(true)
        .build(&schema)
        .map_err(|e| anyhow::anyhow!("Embedded JSON schema is invalid: {}", e))?;
    if let Err(error) = validator.validate(instance) {
        anyhow::bail!("Configuration does not match the schema: {}", error);
    }
    Ok(())
}
