// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File store interface.
//!
//! The flow layer does not implement storage. It addresses files by
//! structured [`StorePath`]s and calls a [`FileStore`] supplied by the
//! embedding application. [`MemoryFileStore`] is the in-process
//! implementation used by tests and single-node setups.

pub mod memory;

pub use self::memory::MemoryFileStore;

use std::fmt;

use async_trait::async_trait;

use crate::error::StorageError;

/// Kind of file stored at a path, rendered as its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PathType {
    /// JSONL rows (`.json`).
    Json,
    /// Row offsets of a JSONL file (`.json.index`).
    JsonIndex,
    /// Range index of a sparse upload (`.idx`).
    UploadIndex,
    /// Opaque bytes, no extension.
    #[default]
    Raw,
}

impl PathType {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => ".json",
            Self::JsonIndex => ".json.index",
            Self::UploadIndex => ".idx",
            Self::Raw => "",
        }
    }
}

/// A path in the file store: a list of components plus a file type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorePath {
    components: Vec<String>,
    path_type: PathType,
}

impl StorePath {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            path_type: PathType::Raw,
        }
    }

    /// Extend with more components. Empty components are skipped.
    pub fn join<I, S>(&self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = self.clone();
        path.components.extend(
            components
                .into_iter()
                .map(Into::into)
                .filter(|c: &String| !c.is_empty()),
        );
        path
    }

    pub fn with_type(mut self, path_type: PathType) -> Self {
        self.path_type = path_type;
        self
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    /// True if `self` lies strictly below `dir`.
    pub fn is_under(&self, dir: &StorePath) -> bool {
        self.components.len() > dir.components.len()
            && self.components.starts_with(&dir.components)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}{}", self.components.join("/"), self.path_type.extension())
    }
}

/// Path-addressed byte storage.
///
/// Missing files read as empty and have size 0, so writers can treat
/// "never written" and "empty" alike.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Whole contents of a file.
    async fn read_file(&self, path: &StorePath) -> Result<Vec<u8>, StorageError>;

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    async fn write_at(&self, path: &StorePath, offset: u64, data: &[u8])
    -> Result<(), StorageError>;

    /// Append `data`, returning the offset it was written at.
    async fn append(&self, path: &StorePath, data: &[u8]) -> Result<u64, StorageError>;

    /// Truncate to zero length, creating the file if needed.
    async fn truncate(&self, path: &StorePath) -> Result<(), StorageError>;

    async fn size(&self, path: &StorePath) -> Result<u64, StorageError>;

    /// Immediate children of a directory path.
    async fn list_children(&self, path: &StorePath) -> Result<Vec<StorePath>, StorageError>;

    async fn delete(&self, path: &StorePath) -> Result<(), StorageError>;
}
