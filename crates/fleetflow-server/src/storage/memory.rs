// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory file store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{FileStore, PathType, StorePath};
use crate::error::StorageError;

/// File store keeping everything in a map. Failures and latency can be
/// injected per path prefix to exercise error handling and interleavings.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<StorePath, Vec<u8>>>,
    failing: Mutex<Vec<String>>,
    delays: Mutex<Vec<(String, Duration)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation on paths whose display form starts with `prefix`.
    pub fn fail_prefix(&self, prefix: impl Into<String>) {
        lock(&self.failing).push(prefix.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Delay every operation on paths whose display form starts with `prefix`.
    pub fn delay_prefix(&self, prefix: impl Into<String>, delay: Duration) {
        lock(&self.delays).push((prefix.into(), delay));
    }

    /// Contents of a file, if it exists.
    pub fn get(&self, path: &StorePath) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    /// Every stored path in sorted order.
    pub fn paths(&self) -> Vec<StorePath> {
        lock(&self.files).keys().cloned().collect()
    }

    async fn check(&self, path: &StorePath) -> Result<(), StorageError> {
        let display = path.to_string();
        let delay = lock(&self.delays)
            .iter()
            .filter(|(p, _)| display.starts_with(p))
            .map(|(_, d)| *d)
            .max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing).iter().any(|p| display.starts_with(p)) {
            return Err(StorageError::Backend {
                path: display,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read_file(&self, path: &StorePath) -> Result<Vec<u8>, StorageError> {
        self.check(path).await?;
        Ok(lock(&self.files).get(path).cloned().unwrap_or_default())
    }

    async fn write_at(
        &self,
        path: &StorePath,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.check(path).await?;
        let mut files = lock(&self.files);
        let file = files.entry(path.clone()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn append(&self, path: &StorePath, data: &[u8]) -> Result<u64, StorageError> {
        self.check(path).await?;
        let mut files = lock(&self.files);
        let file = files.entry(path.clone()).or_default();
        let offset = file.len() as u64;
        file.extend_from_slice(data);
        Ok(offset)
    }

    async fn truncate(&self, path: &StorePath) -> Result<(), StorageError> {
        self.check(path).await?;
        lock(&self.files).insert(path.clone(), Vec::new());
        Ok(())
    }

    async fn size(&self, path: &StorePath) -> Result<u64, StorageError> {
        self.check(path).await?;
        Ok(lock(&self.files).get(path).map_or(0, |f| f.len() as u64))
    }

    async fn list_children(&self, path: &StorePath) -> Result<Vec<StorePath>, StorageError> {
        self.check(path).await?;
        let depth = path.components().len();
        let children: BTreeSet<StorePath> = lock(&self.files)
            .keys()
            .filter(|p| p.is_under(path))
            .map(|p| {
                if p.components().len() == depth + 1 {
                    p.clone()
                } else {
                    // A deeper file implies a directory child.
                    StorePath::new(p.components()[..=depth].iter().cloned())
                        .with_type(PathType::Raw)
                }
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn delete(&self, path: &StorePath) -> Result<(), StorageError> {
        self.check(path).await?;
        lock(&self.files).remove(path);
        Ok(())
    }
}
