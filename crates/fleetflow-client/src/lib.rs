// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetflow client - runs flows dispatched by the fleet server.
//!
//! This crate is the endpoint half of the flow protocol. It tracks every
//! query running for a flow, batches logs, enforces row and upload quotas,
//! reports progress at a bounded rate and routes cancellation from the
//! server to every running query.
//!
//! # Features
//!
//! - **Flow Contexts**: one per flow, owning its queries and its aggregator task
//! - **Query Responders**: per-query handles emitting results with row offsets
//! - **Flow Manager**: registry routing "cancel flow X" to every query of X
//! - **Admission Control**: queries park while host load is above the flow's limits
//! - **Sparse Uploads**: only data ranges are transferred, with a range index
//!
//! # Quick Start
//!
//! ```ignore
//! use fleetflow_client::{ClientConfig, ClientExecutor, FlowManager, Throttler, SysinfoSampler};
//!
//! let config = ClientConfig::from_env()?;
//! let (output, mut outbound) = tokio::sync::mpsc::channel(config.output_buffer);
//!
//! let throttler = Throttler::new(config.sample_window);
//! throttler.spawn_sampler(SysinfoSampler::new(), config.sample_interval());
//!
//! let executor = ClientExecutor::new(config, FlowManager::new(), engine, throttler, output);
//!
//! // For every message delivered by the server on a poll:
//! executor.process_request(message).await?;
//!
//! // The transport drains `outbound` and POSTs the messages in batches.
//! ```
//!
//! Messages from one flow leave the output channel in the order they were
//! produced. Across POSTs there is no ordering, which is why result packets
//! carry row offsets and log batches carry sequence ids.

pub mod config;
pub mod error;
pub mod executor;
pub mod flow_context;
pub mod flow_manager;
pub mod responder;
pub mod throttler;
pub mod uploads;

pub use config::{ClientConfig, ConfigError};
pub use error::{FlowError, Result};
pub use executor::{ClientExecutor, QueryEngine, QueryError};
pub use flow_context::{FlowContext, FlowSettings};
pub use flow_manager::{FlowManager, QueryCloser};
pub use responder::QueryResponder;
pub use throttler::{LoadSample, LoadSampler, SysinfoSampler, Throttle, ThrottleLimits, Throttler};
pub use uploads::{DEFAULT_CHUNK_SIZE, UploadSpan, UploadSummary, upload_ranges};
