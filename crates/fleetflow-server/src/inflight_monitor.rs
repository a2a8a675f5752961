// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting unresponsive flows.
//!
//! Flows handed to a client but silent for longer than the configured
//! timeout are marked UNRESPONSIVE. This covers clients that went offline
//! or crashed mid-flow. A later report from the client brings the flow back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::client_info::ClientInfoManager;

/// Configuration for the in-flight monitor.
#[derive(Debug, Clone)]
pub struct InFlightMonitorConfig {
    /// How often to look for silent flows.
    pub poll_interval: Duration,
    /// Time without activity before a flow is UNRESPONSIVE.
    pub unresponsive_timeout: Duration,
}

impl Default for InFlightMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            unresponsive_timeout: Duration::from_secs(600),
        }
    }
}

/// Background worker that marks silent flows.
pub struct InFlightMonitor {
    client_info: Arc<ClientInfoManager>,
    config: InFlightMonitorConfig,
    shutdown: Arc<Notify>,
}

impl InFlightMonitor {
    pub fn new(client_info: Arc<ClientInfoManager>, config: InFlightMonitorConfig) -> Self {
        Self {
            client_info,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            unresponsive_timeout_secs = self.config.unresponsive_timeout.as_secs(),
            "In-flight monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("In-flight monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "Failed to check in-flight flows");
                    }
                }
            }
        }

        info!("In-flight monitor stopped");
    }

    async fn check(&self) -> crate::error::Result<()> {
        let marked = self
            .client_info
            .check_unresponsive(Utc::now(), self.config.unresponsive_timeout)
            .await?;
        if marked.is_empty() {
            debug!("No unresponsive flows found");
        } else {
            info!(count = marked.len(), "Marked flows unresponsive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flow_store::FlowStore;
    use crate::journal::MemoryJournal;
    use crate::storage::MemoryFileStore;

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let flow_store = Arc::new(FlowStore::new(Arc::new(MemoryFileStore::new())));
        let client_info = Arc::new(ClientInfoManager::new(
            &Config::default(),
            flow_store,
            Arc::new(MemoryJournal::new()),
        ));
        let monitor = Arc::new(InFlightMonitor::new(
            client_info,
            InFlightMonitorConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let shutdown = monitor.shutdown_handle();

        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
