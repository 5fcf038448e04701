// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! Lifecycle coordination for the gateway's background services: the Modbus
//! server loop and the pub/sub client tasks.
//!
//! ## Usage
//!
//! ```no_run
//! use modbus_gateway::daemon::launch_daemon::Daemon;
//! # use modbus_gateway::gateway::RedisPubSubClient;
//! # use modbus_gateway::modbus::ModbusServer;
//!
//! async fn run(server: ModbusServer, client: RedisPubSubClient) -> anyhow::Result<()> {
//!     let mut daemon = Daemon::new();
//!     daemon.launch(server, &client);
//!
//!     // Wait for shutdown signal (e.g., Ctrl+C)
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Clean shutdown
//!     daemon.shutdown();
//!     daemon.join().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;

pub use launch_daemon::Daemon;
