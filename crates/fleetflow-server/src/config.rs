// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::env;
use std::time::Duration;

/// Fleetflow server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Flows a client may run in parallel beyond the base allowance of 2
    pub client_concurrency: usize,
    /// Seconds before an in-flight entry is re-verified against its record
    pub inflight_check_secs: u64,
    /// Seconds without activity before a flow is marked UNRESPONSIVE
    pub unresponsive_secs: u64,
    /// Skip in-flight probes and dispatch without a concurrency limit
    pub disable_inflight_checks: bool,
    /// Row quota applied to flows scheduled without one (0 disables)
    pub default_max_rows: u64,
    /// Upload quota applied to flows scheduled without one (0 disables)
    pub default_max_upload_bytes: u64,
    /// Key for query name obfuscation; names are sent in the clear when unset
    pub obfuscation_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_concurrency: 2,
            inflight_check_secs: 60,
            unresponsive_secs: 600,
            disable_inflight_checks: false,
            default_max_rows: 1_000_000,
            default_max_upload_bytes: 1_000_000_000,
            obfuscation_key: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLEETFLOW_CLIENT_CONCURRENCY`: parallel flows per client (default: 2)
    /// - `FLEETFLOW_INFLIGHT_CHECK_SECS`: in-flight re-verification age (default: 60)
    /// - `FLEETFLOW_UNRESPONSIVE_SECS`: inactivity before UNRESPONSIVE (default: 600)
    /// - `FLEETFLOW_DISABLE_INFLIGHT_CHECKS`: `true`/`1` to disable (default: false)
    /// - `FLEETFLOW_DEFAULT_MAX_ROWS`: default row quota (default: 1000000)
    /// - `FLEETFLOW_DEFAULT_MAX_UPLOAD_BYTES`: default upload quota (default: 1000000000)
    /// - `FLEETFLOW_OBFUSCATION_KEY`: query name obfuscation key (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let disable_inflight_checks = match env::var("FLEETFLOW_DISABLE_INFLIGHT_CHECKS") {
            Ok(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "FLEETFLOW_DISABLE_INFLIGHT_CHECKS",
                        "must be true or false",
                    ));
                }
            },
            Err(_) => defaults.disable_inflight_checks,
        };

        Ok(Self {
            client_concurrency: parse_var(
                "FLEETFLOW_CLIENT_CONCURRENCY",
                defaults.client_concurrency,
                "must be a non-negative integer",
            )?,
            inflight_check_secs: parse_var(
                "FLEETFLOW_INFLIGHT_CHECK_SECS",
                defaults.inflight_check_secs,
                "must be seconds",
            )?,
            unresponsive_secs: parse_var(
                "FLEETFLOW_UNRESPONSIVE_SECS",
                defaults.unresponsive_secs,
                "must be seconds",
            )?,
            disable_inflight_checks,
            default_max_rows: parse_var(
                "FLEETFLOW_DEFAULT_MAX_ROWS",
                defaults.default_max_rows,
                "must be a non-negative integer",
            )?,
            default_max_upload_bytes: parse_var(
                "FLEETFLOW_DEFAULT_MAX_UPLOAD_BYTES",
                defaults.default_max_upload_bytes,
                "must be a non-negative integer",
            )?,
            obfuscation_key: env::var("FLEETFLOW_OBFUSCATION_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
        })
    }

    pub fn with_client_concurrency(mut self, concurrency: usize) -> Self {
        self.client_concurrency = concurrency;
        self
    }

    pub fn with_inflight_check_secs(mut self, secs: u64) -> Self {
        self.inflight_check_secs = secs;
        self
    }

    pub fn with_unresponsive_secs(mut self, secs: u64) -> Self {
        self.unresponsive_secs = secs;
        self
    }

    pub fn with_inflight_checks_disabled(mut self, disabled: bool) -> Self {
        self.disable_inflight_checks = disabled;
        self
    }

    pub fn with_default_limits(mut self, max_rows: u64, max_upload_bytes: u64) -> Self {
        self.default_max_rows = max_rows;
        self.default_max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn with_obfuscation_key(mut self, key: impl Into<String>) -> Self {
        self.obfuscation_key = Some(key.into());
        self
    }

    /// Flows a client may have in flight at once.
    pub fn max_in_flight(&self) -> usize {
        2 + self.client_concurrency
    }

    pub fn inflight_check_interval(&self) -> Duration {
        Duration::from_secs(self.inflight_check_secs)
    }

    pub fn unresponsive_timeout(&self) -> Duration {
        Duration::from_secs(self.unresponsive_secs)
    }
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
