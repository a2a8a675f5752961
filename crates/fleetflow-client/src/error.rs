// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side error types.

use fleetflow_protocol::{MessageKind, PayloadError};
use thiserror::Error;

/// Errors that can occur while running flows on the client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The query or flow scope was cancelled
    #[error("cancelled")]
    Cancelled,

    /// The output channel towards the transport is gone
    #[error("output channel closed")]
    OutputClosed,

    /// The flow has already been torn down
    #[error("flow {0} is closed")]
    FlowClosed(String),

    /// An upload description does not fit its source
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// A message payload could not be unpacked
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// The client was sent a message kind it never handles
    #[error("unexpected message kind: {0:?}")]
    UnexpectedMessage(MessageKind),
}

/// Result type using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
