// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Management Module
//!
//! Runs the gateway's background tasks on the Tokio runtime and coordinates
//! their shutdown:
//!
//! - the Modbus server loop, one task calling `loop_once` until the shared
//!   running flag drops or the transport fails;
//! - the pub/sub client tasks (publisher and subscriber), which have no
//!   cooperative stop and are aborted on join.
//!
//! `shutdown()` only signals; `join()` awaits the cooperative tasks with a
//! timeout and then tears down the rest.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::gateway::RedisPubSubClient;
use crate::modbus::ModbusServer;

/// Poll interval of the server loop; bounds the shutdown latency.
const LOOP_TIMEOUT: Duration = Duration::from_millis(500);

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Task manager for the gateway's background services.
///
/// # Fields
///
/// * `tasks` - Cooperative tasks that watch the running flag
/// * `services` - Detached service tasks, aborted on `join`
/// * `running` - Atomic flag shared between tasks to coordinate shutdown
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    services: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance with the running flag set to `true`.
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            services: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the pub/sub client tasks and the Modbus server loop.
    ///
    /// The server must already be listening and have its cache allocated.
    /// The loop task owns the server; a fatal transport error stops the
    /// whole daemon by clearing the running flag.
    pub fn launch(&mut self, server: ModbusServer, client: &RedisPubSubClient) {
        self.services.extend(client.start());
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let mut server = server;
            info!("Modbus server loop started");
            while running.load(Ordering::SeqCst) {
                if let Err(e) = server.loop_once(Some(LOOP_TIMEOUT)).await {
                    error!("Modbus server failed: {}", e);
                    running.store(false, Ordering::SeqCst);
                    server.close().await;
                    return Err(e.into());
                }
            }
            server.close().await;
            info!("Modbus server loop stopped");
            Ok(())
        });
        self.tasks.push(handle);
    }

    /// True while no task has hit a fatal error and `shutdown` has not been
    /// called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop all running tasks gracefully.
    ///
    /// Signals the tasks to terminate by clearing the shared running flag.
    /// This method only signals; call `join()` afterwards to wait for
    /// completion.
    pub fn shutdown(&self) {
        info!("Shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the cooperative tasks to complete, then abort the service
    /// tasks.
    ///
    /// Task panics and timeouts are logged but do not fail the join.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match tokio::time::timeout(JOIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("Task failed: {}", e),
                Ok(Err(e)) => error!("Task panicked: {}", e),
                Err(_) => warn!("Task did not complete within timeout period, may be hung"),
            }
        }
        for service in self.services {
            service.abort();
            let _ = service.await;
        }
        Ok(())
    }
}
