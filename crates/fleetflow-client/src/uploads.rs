// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunked, sparse-aware file uploads over a query responder.
//!
//! Only the data ranges of a file are transferred. Offsets in the emitted
//! [`FileBuffer`]s address the stored (packed) file; when any range is sparse
//! the final packet carries an [`UploadIndex`] mapping stored ranges back to
//! the original file.

use fleetflow_protocol::{FileBuffer, PathSpec, UploadIndex, UploadRange, UploadTransaction};

use crate::error::{FlowError, Result};
use crate::responder::QueryResponder;

/// Default chunk size for file data.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// A range of the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSpan {
    pub offset: u64,
    pub length: u64,
    /// Sparse ranges are not transferred.
    pub sparse: bool,
}

impl UploadSpan {
    pub fn data(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            sparse: false,
        }
    }

    pub fn sparse(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            sparse: true,
        }
    }
}

/// What was sent for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub upload_id: i64,
    /// Logical size of the original file.
    pub size: u64,
    /// Bytes actually transferred.
    pub stored_size: u64,
    pub packets: usize,
}

/// Upload `source` through `responder`.
///
/// With no `spans` the whole source is sent as one data range.
pub async fn upload_ranges(
    responder: &mut QueryResponder,
    pathspec: PathSpec,
    source: &[u8],
    spans: &[UploadSpan],
    chunk_size: usize,
) -> Result<UploadSummary> {
    let whole = [UploadSpan::data(0, source.len() as u64)];
    let spans = if spans.is_empty() { &whole[..] } else { spans };
    let chunk_size = chunk_size.max(1);

    let size = spans.iter().map(|s| s.offset + s.length).max().unwrap_or(0);
    let stored_size: u64 = spans.iter().filter(|s| !s.sparse).map(|s| s.length).sum();
    let is_sparse = spans.iter().any(|s| s.sparse);

    for span in spans.iter().filter(|s| !s.sparse) {
        if span.offset + span.length > source.len() as u64 {
            return Err(FlowError::InvalidUpload(format!(
                "range {}+{} exceeds source of {} bytes",
                span.offset,
                span.length,
                source.len()
            )));
        }
    }

    let upload_id = responder.next_upload_id();
    responder
        .upload_transaction(UploadTransaction {
            filename: pathspec.path.clone(),
            accessor: pathspec.accessor.clone(),
            components: pathspec.components.clone(),
            store_as_name: pathspec.components.join("/"),
            expected_size: stored_size,
            start_offset: 0,
            upload_id,
        })
        .await?;

    let mut index = UploadIndex::default();
    let mut stored_offset = 0u64;
    let mut packets = 0usize;

    for span in spans {
        index.ranges.push(UploadRange {
            file_offset: stored_offset,
            original_offset: span.offset,
            file_length: if span.sparse { 0 } else { span.length },
            length: span.length,
        });
        if span.sparse {
            continue;
        }

        let start = span.offset as usize;
        let end = start + span.length as usize;
        for chunk in source[start..end].chunks(chunk_size) {
            responder
                .upload_buffer(FileBuffer {
                    pathspec: pathspec.clone(),
                    offset: stored_offset,
                    data: chunk.to_vec(),
                    size,
                    stored_size,
                    is_sparse,
                    upload_number: upload_id,
                    ..Default::default()
                })
                .await?;
            stored_offset += chunk.len() as u64;
            packets += 1;
        }
    }

    responder
        .upload_buffer(FileBuffer {
            pathspec,
            offset: stored_offset,
            size,
            stored_size,
            is_sparse,
            eof: true,
            upload_number: upload_id,
            index: is_sparse.then_some(index),
            ..Default::default()
        })
        .await?;
    packets += 1;

    Ok(UploadSummary {
        upload_id,
        size,
        stored_size,
        packets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_context::{FlowContext, FlowSettings};
    use fleetflow_protocol::{Message, Payload, QueryRequest};
    use tokio::sync::mpsc;

    fn buffers(rx: &mut mpsc::Receiver<Message>) -> Vec<FileBuffer> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Payload::FileBuffer(buffer) = msg.payload {
                out.push(buffer);
            }
        }
        out
    }

    fn pathspec() -> PathSpec {
        PathSpec {
            accessor: "file".into(),
            path: "/tmp/sparse.txt".into(),
            components: vec!["tmp".into(), "sparse.txt".into()],
        }
    }

    #[tokio::test]
    async fn test_sparse_upload_packs_data_ranges() {
        let (tx, mut rx) = mpsc::channel(32);
        let ctx = FlowContext::new("F.1", FlowSettings::default(), tx);
        let (_scope, mut responder) = ctx.new_responder(&QueryRequest::default());

        let spans = [
            UploadSpan::data(0, 6),
            UploadSpan::sparse(6, 6),
            UploadSpan::data(12, 6),
        ];
        let summary = upload_ranges(
            &mut responder,
            pathspec(),
            b"Hello world hello world",
            &spans,
            DEFAULT_CHUNK_SIZE,
        )
        .await
        .unwrap();

        assert_eq!(summary.size, 18);
        assert_eq!(summary.stored_size, 12);

        let sent = buffers(&mut rx);
        assert_eq!(sent.len(), 3);
        assert_eq!((sent[0].offset, sent[0].data.as_slice()), (0, &b"Hello "[..]));
        assert_eq!((sent[1].offset, sent[1].data.as_slice()), (6, &b"hello "[..]));
        assert!(sent[2].eof);
        assert!(sent[2].data.is_empty());

        let index = sent[2].index.as_ref().unwrap();
        assert_eq!(index.ranges.len(), 3);
        assert_eq!(index.ranges[1].file_length, 0);
        assert_eq!(index.ranges[2].file_offset, 6);
        assert_eq!(index.ranges[2].original_offset, 12);
        assert_eq!(responder.status().uploaded_bytes, 12);
        assert_eq!(responder.status().expected_uploaded_bytes, 12);
    }

    #[tokio::test]
    async fn test_dense_upload_is_chunked_without_index() {
        let (tx, mut rx) = mpsc::channel(32);
        let ctx = FlowContext::new("F.1", FlowSettings::default(), tx);
        let (_scope, mut responder) = ctx.new_responder(&QueryRequest::default());

        let summary = upload_ranges(&mut responder, pathspec(), b"0123456789", &[], 4)
            .await
            .unwrap();
        assert_eq!(summary.packets, 4);

        let sent = buffers(&mut rx);
        let offsets: Vec<u64> = sent.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 10]);
        assert!(sent.iter().all(|b| b.index.is_none()));
        assert!(!sent[0].is_sparse);
    }

    #[tokio::test]
    async fn test_range_outside_source_is_rejected() {
        let (tx, _rx) = mpsc::channel(32);
        let ctx = FlowContext::new("F.1", FlowSettings::default(), tx);
        let (_scope, mut responder) = ctx.new_responder(&QueryRequest::default());

        let err = upload_ranges(
            &mut responder,
            pathspec(),
            b"short",
            &[UploadSpan::data(0, 50)],
            DEFAULT_CHUNK_SIZE,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FlowError::InvalidUpload(_)));
    }
}
