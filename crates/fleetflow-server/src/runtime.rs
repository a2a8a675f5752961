// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable server runtime.
//!
//! Wires the flow store, the client task queues, the launcher and the
//! in-flight monitor together. The transport is the embedder's: it calls
//! [`FleetServerRuntime::handle_post`] with each authenticated client POST
//! body and sends back the returned bytes.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleetflow_server::{FleetServerRuntime, MemoryFileStore, MemoryJournal};
//!
//! let runtime = FleetServerRuntime::builder()
//!     .store(Arc::new(MemoryFileStore::new()))
//!     .journal(Arc::new(MemoryJournal::new()))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let reply = runtime.handle_post("C.1234", body).await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use fleetflow_protocol::frame::{decode_batch, encode_batch};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client_info::ClientInfoManager;
use crate::config::Config;
use crate::flow_runner::{FlowRunner, RunnerDeps};
use crate::flow_store::FlowStore;
use crate::inflight_monitor::{InFlightMonitor, InFlightMonitorConfig};
use crate::journal::Journal;
use crate::launcher::Launcher;
use crate::obfuscation::Obfuscator;
use crate::storage::FileStore;

#[derive(Default)]
pub struct FleetServerRuntimeBuilder {
    store: Option<Arc<dyn FileStore>>,
    journal: Option<Arc<dyn Journal>>,
    config: Config,
}

impl std::fmt::Debug for FleetServerRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetServerRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("journal", &self.journal.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl FleetServerRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<FleetServerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let journal = self
            .journal
            .ok_or_else(|| anyhow::anyhow!("journal is required"))?;

        Ok(FleetServerRuntimeConfig {
            store,
            journal,
            config: self.config,
        })
    }
}

pub struct FleetServerRuntimeConfig {
    store: Arc<dyn FileStore>,
    journal: Arc<dyn Journal>,
    config: Config,
}

impl std::fmt::Debug for FleetServerRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetServerRuntimeConfig")
            .field("store", &"...")
            .field("journal", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl FleetServerRuntimeConfig {
    pub async fn start(self) -> Result<FleetServerRuntime> {
        let config = self.config;
        let flow_store = Arc::new(FlowStore::new(self.store));
        let client_info = Arc::new(ClientInfoManager::new(
            &config,
            flow_store.clone(),
            self.journal.clone(),
        ));
        let obfuscator = Obfuscator::new(config.obfuscation_key.as_deref());
        let launcher = Arc::new(Launcher::new(
            &config,
            flow_store.clone(),
            client_info.clone(),
            obfuscator.clone(),
        ));

        let monitor = if config.disable_inflight_checks {
            info!("In-flight checks disabled");
            None
        } else {
            let monitor = Arc::new(InFlightMonitor::new(
                client_info.clone(),
                InFlightMonitorConfig {
                    poll_interval: config.inflight_check_interval(),
                    unresponsive_timeout: config.unresponsive_timeout(),
                },
            ));
            let shutdown = monitor.shutdown_handle();
            let handle = tokio::spawn(async move { monitor.run().await });
            Some((shutdown, handle))
        };

        info!(
            max_in_flight = config.max_in_flight(),
            obfuscation = obfuscator.is_enabled(),
            "FleetServerRuntime started"
        );

        Ok(FleetServerRuntime {
            deps: RunnerDeps {
                flow_store,
                journal: self.journal,
                client_info,
                obfuscator,
            },
            launcher,
            monitor,
        })
    }
}

pub struct FleetServerRuntime {
    deps: RunnerDeps,
    launcher: Arc<Launcher>,
    monitor: Option<(Arc<Notify>, JoinHandle<()>)>,
}

impl std::fmt::Debug for FleetServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetServerRuntime")
            .field("deps", &self.deps)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

impl FleetServerRuntime {
    pub fn builder() -> FleetServerRuntimeBuilder {
        FleetServerRuntimeBuilder::new()
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    pub fn client_info(&self) -> &Arc<ClientInfoManager> {
        &self.deps.client_info
    }

    pub fn flow_store(&self) -> &Arc<FlowStore> {
        &self.deps.flow_store
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.deps.journal
    }

    /// Process one client POST and return the client's next tasks.
    ///
    /// `client_id` is the authenticated identity; whatever the messages
    /// claim as their source is overwritten with it.
    pub async fn handle_post(&self, client_id: &str, body: Bytes) -> crate::error::Result<Bytes> {
        let mut messages = decode_batch(body)?;
        for message in &mut messages {
            message.source = client_id.to_string();
        }
        debug!(client_id, messages = messages.len(), "Processing client batch");

        let mut runner = FlowRunner::new(self.deps.clone(), client_id);
        let processed = runner.process_batch(messages).await;
        runner.close().await;
        processed?;

        let tasks = self.deps.client_info.get_client_tasks(client_id).await;
        Ok(encode_batch(&tasks)?)
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("FleetServerRuntime shutting down...");

        let Some((shutdown, handle)) = self.monitor else {
            info!("FleetServerRuntime shutdown complete");
            return Ok(());
        };
        shutdown.notify_one();

        match handle.await {
            Ok(()) => {
                info!("FleetServerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("In-flight monitor task panicked: {}", e);
                Err(anyhow::anyhow!("monitor task panicked: {}", e))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor
            .as_ref()
            .is_none_or(|(_, handle)| !handle.is_finished())
    }
}
