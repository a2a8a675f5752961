// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetflow-server.
//!
//! Errors split into two classes. Failures writing one result set or one
//! uploaded file are logged and swallowed by the flow runner. Failures on the
//! collection context record itself are fatal for the batch being processed
//! and surface to the caller.

use fleetflow_protocol::FrameError;
use thiserror::Error;

/// Result type using ServerError.
pub type Result<T> = std::result::Result<T, ServerError>;

/// File store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// Nothing stored at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused or failed the operation.
    #[error("storage failure on {path}: {reason}")]
    Backend { path: String, reason: String },
}

/// Server errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The collection context record could not be read or written.
    #[error("Flow record for {flow_id} unavailable: {reason}")]
    FlowRecordUnavailable { flow_id: String, reason: String },

    /// A file store operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A result set refused a write.
    #[error("Result set error: {0}")]
    ResultSet(#[from] crate::result_sets::ResultSetError),

    /// The request was rejected before any work was done.
    #[error("Validation error for '{field}': {message}")]
    Validation { field: String, message: String },

    /// The POST body could not be framed.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ServerError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FlowRecordUnavailable { .. } => "FLOW_RECORD_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::ResultSet(_) => "RESULT_SET_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Frame(_) => "FRAME_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Fatal errors abort the batch; everything else is logged per message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FlowRecordUnavailable { .. } | Self::Frame(_))
    }

    pub(crate) fn flow_record(flow_id: &str, reason: impl ToString) -> Self {
        Self::FlowRecordUnavailable {
            flow_id: flow_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
