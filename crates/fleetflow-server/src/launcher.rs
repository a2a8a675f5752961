// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduling and cancelling flows.

use std::sync::Arc;

use fleetflow_protocol::{Cancel, FlowRequest, Message, Payload};
use tracing::info;
use uuid::Uuid;

use crate::client_info::ClientInfoManager;
use crate::collection_context::CollectionContext;
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::flow_store::FlowStore;
use crate::obfuscation::Obfuscator;

pub struct Launcher {
    flow_store: Arc<FlowStore>,
    client_info: Arc<ClientInfoManager>,
    obfuscator: Obfuscator,
    default_max_rows: u64,
    default_max_upload_bytes: u64,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("obfuscator", &self.obfuscator)
            .field("default_max_rows", &self.default_max_rows)
            .field("default_max_upload_bytes", &self.default_max_upload_bytes)
            .finish()
    }
}

/// A fresh flow id, e.g. `F.3FA85F6457174`.
pub fn new_flow_id() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("F.{}", &hex[..13])
}

fn validation(field: &str, message: &str) -> ServerError {
    ServerError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

impl Launcher {
    pub fn new(
        config: &Config,
        flow_store: Arc<FlowStore>,
        client_info: Arc<ClientInfoManager>,
        obfuscator: Obfuscator,
    ) -> Self {
        Self {
            flow_store,
            client_info,
            obfuscator,
            default_max_rows: config.default_max_rows,
            default_max_upload_bytes: config.default_max_upload_bytes,
        }
    }

    /// Schedule `request` on a client. Returns the new flow id.
    pub async fn schedule_flow(
        &self,
        client_id: &str,
        mut request: FlowRequest,
        principal: &str,
    ) -> Result<String> {
        if client_id.is_empty() {
            return Err(validation("client_id", "must not be empty"));
        }
        if request.queries.is_empty() {
            return Err(validation("queries", "at least one query is required"));
        }

        let flow_id = new_flow_id();
        if request.creator.is_empty() {
            request.creator = principal.to_string();
        }
        if request.max_rows == 0 {
            request.max_rows = self.default_max_rows;
        }
        if request.max_upload_bytes == 0 {
            request.max_upload_bytes = self.default_max_upload_bytes;
        }
        let total = request.queries.len() as u64;
        for (i, query) in request.queries.iter_mut().enumerate() {
            query.query_id = i as u64 + 1;
            query.total_queries = total;
        }

        // The record keeps the names in the clear.
        let ctx = CollectionContext::for_request(client_id, &flow_id, &request);

        for source in request.queries.iter_mut().flat_map(|q| q.sources.iter_mut()) {
            source.name = self.obfuscator.obfuscate(&source.name);
        }

        self.flow_store.save(&flow_id, &ctx).await?;
        self.client_info.queue_message(
            client_id,
            Message::new(&flow_id, Payload::FlowRequest(request)),
        );

        info!(
            client_id,
            flow_id = %flow_id,
            creator = %ctx.request.creator,
            queries = total,
            "Flow scheduled"
        );
        Ok(flow_id)
    }

    /// Cancel a flow on behalf of `principal`.
    ///
    /// Returns false if the flow had already finished.
    pub async fn cancel_flow(&self, client_id: &str, flow_id: &str, principal: &str) -> Result<bool> {
        if self.flow_store.load(client_id, flow_id).await?.is_none() {
            return Err(validation("flow_id", "unknown flow"));
        }

        let (_, cancelled) = self
            .flow_store
            .modify(client_id, flow_id, |ctx| ctx.cancel(principal))
            .await?;
        if !cancelled {
            return Ok(false);
        }

        let dropped = self.client_info.remove_tasks_for_flow(client_id, flow_id);
        self.client_info.queue_message(
            client_id,
            Message::new(flow_id, Payload::Cancel(Cancel::by(principal))).urgent(),
        );

        info!(client_id, flow_id, principal, dropped, "Flow cancelled");
        Ok(true)
    }
}
