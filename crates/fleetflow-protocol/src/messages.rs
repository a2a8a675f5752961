// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control messages exchanged between clients and the fleet server.
//!
//! Every message carries the flow it belongs to (`session_id`), the client
//! that produced it (`source`), a request id and exactly one payload. The
//! payload is a sum type so both sides match on message kind exhaustively.

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::MessageKind;

/// Session id of the permanent event-monitoring flow. It is never cancelled.
pub const MONITORING_FLOW_ID: &str = "F.Monitoring";

/// Session id used by the server when probing a client about in-flight flows.
pub const STATUS_CHECK_FLOW_ID: &str = "F.StatusCheck";

/// Error reported for a flow the client has no record of.
pub const UNKNOWN_FLOW_MESSAGE: &str = "Flow not known - maybe the client crashed?";

/// Log level names used in log batches.
pub const LEVEL_DEFAULT: &str = "DEFAULT";
pub const LEVEL_INFO: &str = "INFO";
pub const LEVEL_WARN: &str = "WARN";
pub const LEVEL_ERROR: &str = "ERROR";
pub const LEVEL_ALERT: &str = "ALERT";

/// Upper bound on a decompressed response payload.
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024 * 1024;

/// Errors produced while unpacking a message payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("decompression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

// ============================================================================
// Envelope
// ============================================================================

/// One control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Flow id this message belongs to.
    pub session_id: String,
    /// Client id. Overwritten by the server with the authenticated identity.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub request_id: u64,
    /// Urgent messages are sent ahead of batched output.
    #[serde(default)]
    pub urgent: bool,
    pub payload: Payload,
}

impl Message {
    pub fn new(session_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            session_id: session_id.into(),
            source: String::new(),
            request_id: 0,
            urgent: false,
            payload,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// The wire kind of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// The one-of payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    LogMessage(LogMessage),
    VqlResponse(VqlResponse),
    FlowStats(FlowStats),
    FileBuffer(FileBuffer),
    UploadTransaction(UploadTransaction),
    Cancel(Cancel),
    FlowRequest(FlowRequest),
    FlowStatsRequest(FlowStatsRequest),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::LogMessage(_) => MessageKind::LogMessage,
            Payload::VqlResponse(_) => MessageKind::VqlResponse,
            Payload::FlowStats(_) => MessageKind::FlowStats,
            Payload::FileBuffer(_) => MessageKind::FileBuffer,
            Payload::UploadTransaction(_) => MessageKind::UploadTransaction,
            Payload::Cancel(_) => MessageKind::Cancel,
            Payload::FlowRequest(_) => MessageKind::FlowRequest,
            Payload::FlowStatsRequest(_) => MessageKind::FlowStatsRequest,
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// A named query inside a compiled request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedQuery {
    pub name: String,
    pub vql: String,
}

/// One compiled query of a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub query_id: u64,
    pub total_queries: u64,
    pub artifact: String,
    pub sources: Vec<NamedQuery>,
    pub env: BTreeMap<String, String>,
}

/// Immutable description of a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRequest {
    pub queries: Vec<QueryRequest>,
    /// 0 disables the row quota.
    pub max_rows: u64,
    /// 0 disables the upload quota.
    pub max_upload_bytes: u64,
    /// Stats reporting interval. 0 uses the client default.
    pub flow_update_time_ms: u64,
    /// Log batching interval. 0 uses the client default.
    pub log_batch_time_ms: u64,
    pub cpu_limit: f64,
    pub iops_limit: f64,
    pub ops_per_sec: f64,
    pub timeout_secs: u64,
    pub creator: String,
}

/// Cancel every query of the addressed flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cancel {
    pub principal: String,
}

impl Cancel {
    pub fn by(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }
}

/// Ask the client to report on flows the server believes are in flight.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowStatsRequest {
    pub flow_ids: Vec<String>,
}

// ============================================================================
// Client -> server
// ============================================================================

/// Per-query status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    #[default]
    Progress,
    Ok,
    GenericError,
    /// The client has no record of the flow.
    UnknownFlow,
}

impl StatusCode {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusCode::Progress)
    }

    pub fn is_error(self) -> bool {
        matches!(self, StatusCode::GenericError | StatusCode::UnknownFlow)
    }
}

/// Status of one query of a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryStatus {
    pub status: StatusCode,
    pub query_id: u64,
    pub total_queries: u64,
    pub artifact: String,
    pub names_with_response: Vec<String>,
    pub log_rows: u64,
    pub result_rows: u64,
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    pub expected_uploaded_bytes: u64,
    pub duration_ns: u64,
    /// Unix microseconds.
    pub first_active: u64,
    /// Unix microseconds.
    pub last_active: u64,
    pub error_message: String,
    pub backtrace: String,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

/// Aggregate progress report for a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowStats {
    pub query_status: Vec<QueryStatus>,
    pub flow_complete: bool,
    pub total_collected_rows: u64,
    pub total_uploaded_files: u64,
    pub total_uploaded_bytes: u64,
    pub total_expected_uploaded_bytes: u64,
    pub total_logs: u64,
    pub transactions_outstanding: u64,
    /// Unix microseconds.
    pub timestamp: u64,
}

impl FlowStats {
    /// A report for a flow the client does not know about.
    pub fn unknown_flow(timestamp: u64) -> Self {
        Self {
            query_status: vec![QueryStatus {
                status: StatusCode::UnknownFlow,
                error_message: UNKNOWN_FLOW_MESSAGE.to_string(),
                ..Default::default()
            }],
            flow_complete: true,
            timestamp,
            ..Default::default()
        }
    }
}

/// A batch of log lines in JSONL form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMessage {
    /// Sequence number of the first line in this batch.
    pub id: u64,
    pub number_of_rows: u64,
    pub jsonl: String,
    /// First ERROR line seen by the flow, sent once.
    pub error_message: String,
    pub level: String,
    pub artifact: String,
}

/// A single line inside [`LogMessage::jsonl`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Unix seconds.
    pub client_time: u64,
    pub level: String,
    pub message: String,
}

impl LogLine {
    /// Render as one JSONL line, newline included.
    pub fn to_jsonl(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// A batch of result rows for one named query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VqlResponse {
    pub query: NamedQuery,
    pub query_id: u64,
    pub jsonl_response: String,
    /// zstd compressed JSONL, used instead of `jsonl_response` when non-empty.
    #[serde(with = "base64_bytes")]
    pub compressed_jsonl_response: Vec<u8>,
    pub total_rows: u64,
    /// Row offset of the first row of this packet in the result set.
    pub query_start_row: u64,
    /// Packet number for this query, starting at 0.
    pub part: u64,
    pub columns: Vec<String>,
    pub timestamp: u64,
}

impl VqlResponse {
    /// The JSONL payload, decompressing if needed.
    pub fn jsonl(&self) -> Result<String, PayloadError> {
        self.jsonl_with_limit(MAX_DECOMPRESSED_SIZE)
    }

    /// [`jsonl`](Self::jsonl), refusing to decompress more than `limit` bytes.
    pub fn jsonl_with_limit(&self, limit: u64) -> Result<String, PayloadError> {
        if self.compressed_jsonl_response.is_empty() {
            return Ok(self.jsonl_response.clone());
        }
        let decoder = zstd::stream::read::Decoder::new(&self.compressed_jsonl_response[..])?;
        let mut raw = Vec::new();
        // One byte past the limit tells a full payload from an oversized one.
        decoder.take(limit.saturating_add(1)).read_to_end(&mut raw)?;
        if raw.len() as u64 > limit {
            return Err(PayloadError::TooLarge { limit });
        }
        Ok(String::from_utf8(raw)?)
    }

    /// Move the JSONL payload into the compressed field.
    pub fn compress(mut self) -> Result<Self, PayloadError> {
        let compressed = zstd::stream::encode_all(self.jsonl_response.as_bytes(), 0)?;
        self.compressed_jsonl_response = compressed;
        self.jsonl_response.clear();
        Ok(self)
    }
}

/// Location of an uploaded file on the client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSpec {
    pub accessor: String,
    pub path: String,
    pub components: Vec<String>,
}

/// Maps a range of the stored (packed) file onto the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadRange {
    pub file_offset: u64,
    pub original_offset: u64,
    /// Bytes present in the stored file. 0 for a sparse range.
    pub file_length: u64,
    /// Bytes this range covers in the original file.
    pub length: u64,
}

/// Range index of a sparse upload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadIndex {
    pub ranges: Vec<UploadRange>,
}

/// One chunk of an uploaded file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileBuffer {
    pub pathspec: PathSpec,
    /// Offset in the stored file.
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Logical size of the original file.
    pub size: u64,
    /// Bytes actually transferred for the whole file.
    pub stored_size: u64,
    pub is_sparse: bool,
    pub eof: bool,
    pub upload_number: i64,
    pub index: Option<UploadIndex>,
}

/// Resumable-upload audit record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadTransaction {
    pub filename: String,
    pub accessor: String,
    pub components: Vec<String>,
    pub store_as_name: String,
    pub expected_size: u64,
    pub start_offset: u64,
    pub upload_id: i64,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
