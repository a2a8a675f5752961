// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Offset-addressable JSONL result sets.
//!
//! A result set is a `.json` file of JSONL rows plus a `.json.index` side
//! file holding one 8-byte little-endian offset per row. The index makes the
//! committed row count cheap to read, which is what retransmission filtering
//! relies on: a writer refuses to move its start row backwards past rows
//! that are already committed.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::{FileStore, PathType, StorePath};

const INDEX_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResultSetError {
    /// The requested start row is before rows already committed.
    #[error("cannot rewind result set from row {committed} to row {requested}")]
    Rewind { requested: u64, committed: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("row is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// How to treat an existing result set when opening a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Append,
    Truncate,
}

fn data_path(path: &StorePath) -> StorePath {
    path.clone().with_type(PathType::Json)
}

fn index_path(path: &StorePath) -> StorePath {
    path.clone().with_type(PathType::JsonIndex)
}

/// Appends rows to a result set.
pub struct ResultSetWriter {
    store: Arc<dyn FileStore>,
    data: StorePath,
    index: StorePath,
    total_rows: u64,
}

impl std::fmt::Debug for ResultSetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSetWriter")
            .field("store", &"...")
            .field("path", &self.data.to_string())
            .field("total_rows", &self.total_rows)
            .finish()
    }
}

impl ResultSetWriter {
    pub async fn open(
        store: Arc<dyn FileStore>,
        path: &StorePath,
        mode: WriteMode,
    ) -> Result<Self, ResultSetError> {
        let data = data_path(path);
        let index = index_path(path);

        if mode == WriteMode::Truncate {
            store.truncate(&data).await?;
            store.truncate(&index).await?;
        }

        let total_rows = store.size(&index).await? / INDEX_ENTRY_SIZE;

        Ok(Self {
            store,
            data,
            index,
            total_rows,
        })
    }

    /// Position the writer at row `start` as claimed by the sender.
    ///
    /// Moving backwards is refused with [`ResultSetError::Rewind`]. A gap
    /// ahead of the committed rows is accepted and rows keep going to the
    /// end of the set.
    pub fn set_start_row(&mut self, start: u64) -> Result<(), ResultSetError> {
        if start < self.total_rows {
            return Err(ResultSetError::Rewind {
                requested: start,
                committed: self.total_rows,
            });
        }
        if start > self.total_rows {
            debug!(
                path = %self.data,
                committed = self.total_rows,
                requested = start,
                "Gap in result set, appending at end"
            );
        }
        Ok(())
    }

    /// Append JSONL text. Blank lines are skipped. Returns the rows written.
    pub async fn write_jsonl(&mut self, jsonl: &str) -> Result<u64, ResultSetError> {
        let mut data = BytesMut::with_capacity(jsonl.len() + 1);
        let mut starts = Vec::new();

        for line in jsonl.lines().map(str::trim).filter(|l| !l.is_empty()) {
            starts.push(data.len() as u64);
            data.put_slice(line.as_bytes());
            data.put_u8(b'\n');
        }
        if starts.is_empty() {
            return Ok(0);
        }

        // Index entries are relative to where the store actually put the data.
        let base = self.store.append(&self.data, &data).await?;
        let mut index = BytesMut::with_capacity(starts.len() * INDEX_ENTRY_SIZE as usize);
        for start in &starts {
            index.put_u64_le(base + start);
        }
        self.store.append(&self.index, &index).await?;

        let rows = starts.len() as u64;
        self.total_rows += rows;
        Ok(rows)
    }

    /// Append one serializable row.
    pub async fn write_row<T: Serialize + ?Sized>(&mut self, row: &T) -> Result<(), ResultSetError> {
        let line = serde_json::to_string(row)?;
        self.write_jsonl(&line).await?;
        Ok(())
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Finish writing. Returns the committed row count.
    pub fn close(self) -> u64 {
        self.total_rows
    }
}

/// Reads rows back from a result set.
pub struct ResultSetReader {
    data: Vec<u8>,
    offsets: Vec<u64>,
    cursor: usize,
}

impl ResultSetReader {
    pub async fn open(store: &dyn FileStore, path: &StorePath) -> Result<Self, ResultSetError> {
        let data = store.read_file(&data_path(path)).await?;
        let mut index = bytes::Bytes::from(store.read_file(&index_path(path)).await?);

        let mut offsets = Vec::with_capacity(index.len() / INDEX_ENTRY_SIZE as usize);
        while index.remaining() >= INDEX_ENTRY_SIZE as usize {
            offsets.push(index.get_u64_le());
        }

        Ok(Self {
            data,
            offsets,
            cursor: 0,
        })
    }

    pub fn total_rows(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Continue reading from `row`. Seeking past the end yields no rows.
    pub fn seek_to_row(&mut self, row: u64) {
        self.cursor = (row as usize).min(self.offsets.len());
    }

    /// Raw JSON text of every row from the cursor to the end.
    pub fn lines(&self) -> Vec<&str> {
        // Concurrent writers may interleave index entries, so a row ends at
        // its own newline rather than at the next offset.
        self.offsets[self.cursor..]
            .iter()
            .filter_map(|&start| {
                let tail = self.data.get(start as usize..)?;
                let end = tail.iter().position(|&b| b == b'\n').unwrap_or(tail.len());
                std::str::from_utf8(&tail[..end]).ok()
            })
            .collect()
    }

    /// Parsed rows from the cursor to the end.
    pub fn rows(&self) -> Result<Vec<serde_json::Value>, ResultSetError> {
        self.lines()
            .into_iter()
            .map(|line| serde_json::from_str(line).map_err(ResultSetError::from))
            .collect()
    }
}
