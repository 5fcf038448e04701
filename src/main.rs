// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the Modbus pub/sub gateway

use anyhow::Result;
use clap::Parser;
use log::info;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use modbus_gateway::config::{self, Config};
use modbus_gateway::daemon::Daemon;
use modbus_gateway::gateway::{build_gateway, PubSubClient, RedisPubSubClient};
use modbus_gateway::modbus::{ModbusBackend, ModbusServer, RtuBackend, TcpBackend};

/// Modbus TCP/RTU slave gateway mirroring data points onto Redis pub/sub
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a configuration to validate and exit
    #[arg(long)]
    validate_config: Option<PathBuf>,

    /// Output the configuration schema as JSON and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Modbus TCP bind address override
    #[arg(long)]
    host: Option<String>,

    /// Modbus TCP port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Redis connection URL override
    #[arg(long)]
    redis_url: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        return config::output_config_schema();
    }

    if let Some(validate_path) = args.validate_config {
        if !validate_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                validate_path.display()
            ));
        }
        Config::from_file(&validate_path)
            .map_err(|err| anyhow::anyhow!("Configuration validation failed: {}", err))?;
        println!("Configuration file is valid: {}", validate_path.display());
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;
    config.apply_overrides(
        args.host.as_deref(),
        args.port,
        args.redis_url.as_deref(),
    );

    let backend: Box<dyn ModbusBackend> = match &config.modbus.path {
        Some(path) => {
            info!("Serving Modbus RTU on {}", path);
            Box::new(RtuBackend::new(
                path,
                config.modbus.baud_rate,
                config.modbus.parity.chars().next().unwrap_or('N'),
                config.modbus.data_bits,
                config.modbus.stop_bits,
            )?)
        }
        None => {
            info!(
                "Serving Modbus TCP on {}:{}",
                config.modbus.address, config.modbus.port
            );
            Box::new(TcpBackend::new(&config.modbus.address, config.modbus.port))
        }
    };

    let client = Arc::new(RedisPubSubClient::new(&config.redis.url));
    let pubsub: Arc<dyn PubSubClient> = client.clone();
    let mut server = ModbusServer::new(backend);
    build_gateway(&mut server, &pubsub, &config.registers)?;
    server.listen().await?;
    server.allocate_cache();

    let mut daemon = Daemon::new();
    daemon.launch(server, &client);

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal, terminating daemon");
            daemon.shutdown();
            daemon.join().await?;
        }
        Err(err) => {
            eprintln!("Error waiting for shutdown signal: {}", err);
        }
    }

    Ok(())
}
