//! Runs every device on its own task until the process is told to stop.

use anyhow::{Context, Result};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::devices::{Device, DeviceKind, NodeServices};
use crate::mqtt::DeviceIdentity;

pub struct Scheduler {
    services: NodeServices,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(services: NodeServices) -> Self {
        Self {
            services,
            tasks: Vec::new(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.tasks.len()
    }

    /// Start `kind` on its own task: construction, then the poll loop.
    /// A device that fails to start is logged and left out; the others keep
    /// running.
    pub fn spawn<K: DeviceKind>(&mut self, identity: DeviceIdentity, kind: K) {
        let services = self.services.clone();
        self.tasks.push(tokio::spawn(async move {
            match Device::start(identity.clone(), kind, &services).await {
                Ok(device) => device.run().await,
                Err(e) => error!(device = %identity, kind = K::LABEL, "device failed to start: {e:#}"),
            }
        }));
    }

    /// Bring up the broker link, then idle until `shutdown` resolves. Device
    /// tasks are aborted, not drained.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let link = self.services.link.clone();
        let connector = tokio::spawn(async move { link.connect().await });

        info!(devices = self.device_count(), "scheduler started");
        shutdown.await;
        info!("shutdown requested, exiting");

        connector.abort();
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }

    /// `run_until` Ctrl-C (or SIGTERM on unix).
    pub async fn run_until_shutdown(self) -> Result<()> {
        let signal = shutdown_signal().await?;
        self.run_until(signal).await
    }
}

/// Install the signal handlers up front so a failure surfaces as an error
/// instead of a silent never-firing future.
async fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("received Ctrl-C"),
                Err(e) => error!("Ctrl-C handler failed: {e}"),
            },
            _ = terminate => info!("received SIGTERM"),
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
