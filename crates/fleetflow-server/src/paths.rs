// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage layout of a flow.

use crate::storage::{PathType, StorePath};

/// Resolves every storage path belonging to one (client, flow).
#[derive(Debug, Clone)]
pub struct FlowPathManager {
    client_id: String,
    flow_id: String,
}

impl FlowPathManager {
    pub fn new(client_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            flow_id: flow_id.into(),
        }
    }

    fn client(&self) -> StorePath {
        StorePath::new(["clients", self.client_id.as_str()])
    }

    fn collection(&self) -> StorePath {
        self.client().join(["collections", self.flow_id.as_str()])
    }

    /// The collection context record.
    pub fn context(&self) -> StorePath {
        self.collection().join(["context"])
    }

    /// Flow log result set.
    pub fn log(&self) -> StorePath {
        self.collection().join(["logs"])
    }

    /// Upload metadata result set.
    pub fn upload_metadata(&self) -> StorePath {
        self.collection().join(["uploads"])
    }

    /// Upload transaction log result set.
    pub fn upload_transactions(&self) -> StorePath {
        self.collection().join(["upload_transactions"])
    }

    /// Destination of an uploaded file.
    pub fn upload_file(&self, accessor: &str, components: &[String]) -> StorePath {
        let accessor = if accessor.is_empty() { "auto" } else { accessor };
        self.collection()
            .join(["uploads", accessor])
            .join(components.iter().map(String::as_str))
    }

    /// Range index stored next to a sparse upload.
    pub fn upload_index(file: &StorePath) -> StorePath {
        file.clone().with_type(PathType::UploadIndex)
    }

    /// Result set for a query named `Artifact` or `Artifact/Source`.
    pub fn artifact(&self, query_name: &str) -> StorePath {
        let (artifact, source) = split_query_name(query_name);
        self.client()
            .join(["artifacts", artifact])
            .join(source)
            .join([self.flow_id.as_str()])
    }

    /// Result set for an event artifact of the monitoring flow.
    pub fn monitoring(client_id: &str, query_name: &str) -> StorePath {
        let (artifact, source) = split_query_name(query_name);
        StorePath::new(["clients", client_id, "monitoring", artifact]).join(source)
    }

    /// Log of the monitoring flow.
    pub fn monitoring_log(client_id: &str) -> StorePath {
        StorePath::new(["clients", client_id, "monitoring_logs"])
    }
}

/// Split `Artifact/Source` into its parts.
pub fn split_query_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('/') {
        Some((artifact, source)) if !source.is_empty() => (artifact, Some(source)),
        Some((artifact, _)) => (artifact, None),
        None => (name, None),
    }
}
