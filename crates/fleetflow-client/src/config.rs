// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use fleetflow_protocol::FlowRequest;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client ID (required) - identity stamped on outgoing messages
    pub client_id: String,
    /// Default interval between progress reports in milliseconds (default: 5_000)
    pub stats_interval_ms: u64,
    /// Default log batching interval in milliseconds (default: 5_000)
    pub log_batch_ms: u64,
    /// Capacity of the output channel towards the transport (default: 10)
    pub output_buffer: usize,
    /// Host load sampling interval in milliseconds (default: 1_000)
    pub sample_interval_ms: u64,
    /// Number of samples in the rolling load average (default: 5)
    pub sample_window: usize,
    /// How many cancelled flow ids are remembered (default: 1_000)
    pub cancelled_history: usize,
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `FLEETFLOW_CLIENT_ID` - Identity of this client
    ///
    /// # Optional Environment Variables
    /// - `FLEETFLOW_STATS_INTERVAL_MS` - Progress report interval (default: 5000)
    /// - `FLEETFLOW_LOG_BATCH_MS` - Log batching interval (default: 5000)
    /// - `FLEETFLOW_OUTPUT_BUFFER` - Output channel capacity (default: 10)
    /// - `FLEETFLOW_SAMPLE_INTERVAL_MS` - Load sampling interval (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id =
            env::var("FLEETFLOW_CLIENT_ID").map_err(|_| ConfigError::Missing("FLEETFLOW_CLIENT_ID"))?;

        let stats_interval_ms = parse_var("FLEETFLOW_STATS_INTERVAL_MS", 5_000, "must be milliseconds")?;
        let log_batch_ms = parse_var("FLEETFLOW_LOG_BATCH_MS", 5_000, "must be milliseconds")?;
        let output_buffer: usize =
            parse_var("FLEETFLOW_OUTPUT_BUFFER", 10, "must be a positive integer")?;
        if output_buffer == 0 {
            return Err(ConfigError::Invalid(
                "FLEETFLOW_OUTPUT_BUFFER",
                "must be a positive integer",
            ));
        }
        let sample_interval_ms =
            parse_var("FLEETFLOW_SAMPLE_INTERVAL_MS", 1_000, "must be milliseconds")?;

        Ok(Self {
            client_id,
            stats_interval_ms,
            log_batch_ms,
            output_buffer,
            sample_interval_ms,
            ..Self::new("")
        })
    }

    /// Create a configuration with defaults for the given client.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            stats_interval_ms: 5_000,
            log_batch_ms: 5_000,
            output_buffer: 10,
            sample_interval_ms: 1_000,
            sample_window: 5,
            cancelled_history: 1_000,
        }
    }

    /// Set the default progress report interval.
    pub fn with_stats_interval_ms(mut self, ms: u64) -> Self {
        self.stats_interval_ms = ms;
        self
    }

    /// Set the default log batching interval.
    pub fn with_log_batch_ms(mut self, ms: u64) -> Self {
        self.log_batch_ms = ms;
        self
    }

    /// Set the output channel capacity.
    pub fn with_output_buffer(mut self, capacity: usize) -> Self {
        self.output_buffer = capacity.max(1);
        self
    }

    /// Set the load sampling interval.
    pub fn with_sample_interval_ms(mut self, ms: u64) -> Self {
        self.sample_interval_ms = ms;
        self
    }

    /// Stats interval for a flow, honouring the request override.
    pub fn stats_interval(&self, request: &FlowRequest) -> Duration {
        Duration::from_millis(pick(request.flow_update_time_ms, self.stats_interval_ms))
    }

    /// Log batch interval for a flow, honouring the request override.
    pub fn log_batch_delay(&self, request: &FlowRequest) -> Duration {
        Duration::from_millis(pick(request.log_batch_time_ms, self.log_batch_ms))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

fn pick(requested: u64, default: u64) -> u64 {
    if requested > 0 { requested } else { default.max(1) }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
