// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetflow Protocol - control messages exchanged between endpoint clients
//! and the fleet server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    fleetflow-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: {session, source, request id, one-of payload}    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length + kind prefixed frames, one batch per POST │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport that carries a batch is not part of this crate. A POST body
//! is simply a concatenation of frames; see [`frame::encode_batch`] and
//! [`frame::decode_batch`].
//!
//! # Usage
//!
//! ```ignore
//! use fleetflow_protocol::{Message, Payload, Cancel, frame};
//!
//! let msg = Message::new("F.1234", Payload::Cancel(Cancel::by("admin")));
//! let body = frame::encode_batch(&[msg])?;
//! let decoded = frame::decode_batch(body)?;
//! ```

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError, MessageKind};
pub use messages::*;
