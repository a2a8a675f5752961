// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event journal: named queues of JSON rows that watchers subscribe to.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StorageError;

/// Published once per flow when it reaches FINISHED or ERROR.
pub const FLOW_COMPLETION_QUEUE: &str = "System.Flow.Completion";
/// Published when an uploaded file has been fully received.
pub const UPLOAD_COMPLETION_QUEUE: &str = "System.Upload.Completion";
/// ALERT log lines sent by clients.
pub const ALERTS_QUEUE: &str = "Server.Internal.Alerts";
/// Flows handed to a client.
pub const CLIENT_SCHEDULED_QUEUE: &str = "Server.Internal.ClientScheduled";

const BROADCAST_CAPACITY: usize = 1024;

#[async_trait]
pub trait Journal: Send + Sync {
    async fn push_rows(&self, queue: &str, rows: Vec<Value>) -> Result<(), StorageError>;
}

/// A row pushed to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEvent {
    pub queue: String,
    pub row: Value,
}

/// In-memory journal retaining every row.
pub struct MemoryJournal {
    queues: Mutex<HashMap<String, Vec<Value>>>,
    events: broadcast::Sender<JournalEvent>,
}

impl std::fmt::Debug for MemoryJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJournal")
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            queues: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows pushed to `queue` so far.
    pub fn rows(&self, queue: &str) -> Vec<Value> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to rows pushed to `queue` from now on.
    pub fn watch(&self, queue: &str) -> JournalWatcher {
        JournalWatcher {
            queue: queue.to_string(),
            rx: self.events.subscribe(),
        }
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn push_rows(&self, queue: &str, rows: Vec<Value>) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        debug!(queue, rows = rows.len(), "Pushing journal rows");

        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_string())
            .or_default()
            .extend(rows.iter().cloned());

        for row in rows {
            // No watchers is fine.
            let _ = self.events.send(JournalEvent {
                queue: queue.to_string(),
                row,
            });
        }
        Ok(())
    }
}

/// Receives rows of one queue.
pub struct JournalWatcher {
    queue: String,
    rx: broadcast::Receiver<JournalEvent>,
}

impl JournalWatcher {
    /// Next row of the watched queue. Returns None once the journal is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.queue == self.queue => return Some(event.row),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(queue = %self.queue, skipped, "Journal watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
