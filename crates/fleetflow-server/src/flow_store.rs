// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of collection context records.
//!
//! Every read-modify-write of a record runs under a lock owned by that
//! (client, flow) pair, so two batches for the same flow serialize while
//! batches for different flows proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::collection_context::CollectionContext;
use crate::error::{Result, ServerError};
use crate::paths::FlowPathManager;
use crate::storage::{FileStore, PathType, StorePath};

type FlowKey = (String, String);

pub struct FlowStore {
    store: Arc<dyn FileStore>,
    locks: Mutex<HashMap<FlowKey, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for FlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStore")
            .field("store", &"...")
            .field("locked_flows", &self.lock_map().len())
            .finish()
    }
}

fn record_path(client_id: &str, flow_id: &str) -> StorePath {
    FlowPathManager::new(client_id, flow_id)
        .context()
        .with_type(PathType::Json)
}

impl FlowStore {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The file store records and result sets live in.
    pub fn file_store(&self) -> Arc<dyn FileStore> {
        self.store.clone()
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<FlowKey, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flow_lock(&self, client_id: &str, flow_id: &str) -> Arc<AsyncMutex<()>> {
        self.lock_map()
            .entry((client_id.to_string(), flow_id.to_string()))
            .or_default()
            .clone()
    }

    fn release(&self, client_id: &str, flow_id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.lock_map();
        // Only the map and this handle left: nobody is waiting.
        if Arc::strong_count(lock) == 2 {
            locks.remove(&(client_id.to_string(), flow_id.to_string()));
        }
    }

    /// Take the flow's lock until the returned guard is dropped.
    ///
    /// Ingestion that must check and write atomically against other batches
    /// of the same flow holds this guard and updates the record through
    /// [`FlowGuard::modify`].
    pub async fn lock(&self, client_id: &str, flow_id: &str) -> FlowGuard<'_> {
        let lock = self.flow_lock(client_id, flow_id);
        let guard = lock.clone().lock_owned().await;
        FlowGuard {
            store: self,
            client_id: client_id.to_string(),
            flow_id: flow_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Read a record without locking. Returns None if it was never written.
    pub async fn load(&self, client_id: &str, flow_id: &str) -> Result<Option<CollectionContext>> {
        let data = self
            .store
            .read_file(&record_path(client_id, flow_id))
            .await
            .map_err(|e| ServerError::flow_record(flow_id, e))?;
        if data.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| ServerError::flow_record(flow_id, e))
    }

    /// Overwrite a record without locking.
    pub async fn save(&self, flow_id: &str, ctx: &CollectionContext) -> Result<()> {
        let path = record_path(&ctx.client_id, flow_id);
        let data = serde_json::to_vec(ctx).map_err(|e| ServerError::flow_record(flow_id, e))?;
        self.store
            .truncate(&path)
            .await
            .map_err(|e| ServerError::flow_record(flow_id, e))?;
        self.store
            .write_at(&path, 0, &data)
            .await
            .map_err(|e| ServerError::flow_record(flow_id, e))
    }

    /// Apply `f` to the record under the flow's lock and persist the result.
    ///
    /// A flow with no record gets an empty RUNNING one, so reports for flows
    /// the server has forgotten are still kept.
    pub async fn modify<F, R>(&self, client_id: &str, flow_id: &str, f: F) -> Result<(CollectionContext, R)>
    where
        F: FnOnce(&mut CollectionContext) -> R,
    {
        let guard = self.lock(client_id, flow_id).await;
        let result = guard.modify(f).await;
        drop(guard);
        result
    }

    async fn modify_locked<F, R>(
        &self,
        client_id: &str,
        flow_id: &str,
        f: F,
    ) -> Result<(CollectionContext, R)>
    where
        F: FnOnce(&mut CollectionContext) -> R,
    {
        let mut ctx = match self.load(client_id, flow_id).await? {
            Some(ctx) => ctx,
            None => {
                debug!(client_id, flow_id, "Creating record for unknown flow");
                CollectionContext::new(client_id, flow_id)
            }
        };
        let out = f(&mut ctx);
        self.save(flow_id, &ctx).await?;
        Ok((ctx, out))
    }
}

/// Exclusive access to one flow, released on drop.
pub struct FlowGuard<'a> {
    store: &'a FlowStore,
    client_id: String,
    flow_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for FlowGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGuard")
            .field("client_id", &self.client_id)
            .field("flow_id", &self.flow_id)
            .finish()
    }
}

impl FlowGuard<'_> {
    /// [`FlowStore::modify`] without taking the lock again.
    pub async fn modify<F, R>(&self, f: F) -> Result<(CollectionContext, R)>
    where
        F: FnOnce(&mut CollectionContext) -> R,
    {
        self.store
            .modify_locked(&self.client_id, &self.flow_id, f)
            .await
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        // The owned guard holds its own handle; let it go first.
        self.guard.take();
        self.store.release(&self.client_id, &self.flow_id, &self.lock);
    }
}
