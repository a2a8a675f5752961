// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetflow server - schedules flows and ingests what clients send back.
//!
//! Clients report over a stateless request/response transport, so messages
//! for one flow can arrive duplicated, reordered or long after the flow
//! ended. This crate turns that stream into a consistent per-flow record:
//!
//! - **Result sets** are offset-addressed, so retransmitted packets are dropped
//! - **Collection contexts** merge status reports order-independently
//! - **Quotas** are counted on ingestion and trigger a cancel on breach
//! - **Completion events** are published once, after the data they summarize
//! - **In-flight tracking** bounds concurrent flows per client and flags
//!   clients that went silent
//!
//! Storage and the event journal are traits ([`FileStore`], [`Journal`]);
//! in-memory implementations are provided.
//!
//! # Quick Start
//!
//! ```ignore
//! use fleetflow_server::{Config, FleetServerRuntime, MemoryFileStore, MemoryJournal};
//!
//! let runtime = FleetServerRuntime::builder()
//!     .store(Arc::new(MemoryFileStore::new()))
//!     .journal(Arc::new(MemoryJournal::new()))
//!     .config(Config::from_env()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let flow_id = runtime
//!     .launcher()
//!     .schedule_flow("C.1234", request, "admin")
//!     .await?;
//! ```

pub mod client_info;
pub mod collection_context;
pub mod config;
pub mod error;
pub mod flow_runner;
pub mod flow_store;
pub mod inflight_monitor;
pub mod journal;
pub mod launcher;
pub mod obfuscation;
pub mod paths;
pub mod result_sets;
pub mod runtime;
pub mod storage;

pub use client_info::ClientInfoManager;
pub use collection_context::{CollectionContext, FlowState, ReduceOutcome, reduce};
pub use config::{Config, ConfigError};
pub use error::{Result, ServerError, StorageError};
pub use flow_runner::{FlowRunner, RunnerDeps};
pub use flow_store::{FlowGuard, FlowStore};
pub use inflight_monitor::{InFlightMonitor, InFlightMonitorConfig};
pub use journal::{
    ALERTS_QUEUE, CLIENT_SCHEDULED_QUEUE, FLOW_COMPLETION_QUEUE, Journal, JournalWatcher,
    MemoryJournal, UPLOAD_COMPLETION_QUEUE,
};
pub use launcher::Launcher;
pub use obfuscation::Obfuscator;
pub use paths::FlowPathManager;
pub use result_sets::{ResultSetError, ResultSetReader, ResultSetWriter, WriteMode};
pub use runtime::FleetServerRuntime;
pub use storage::{FileStore, MemoryFileStore, PathType, StorePath};
