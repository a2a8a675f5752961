// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch of server instructions on the client.
//!
//! The [`ClientExecutor`] receives messages delivered by the transport on
//! each poll and turns them into running flows, cancellations and status
//! reports. Query evaluation itself is delegated to a [`QueryEngine`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetflow_protocol::{FlowRequest, Message, Payload, QueryRequest};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{FlowError, Result};
use crate::flow_context::FlowContext;
use crate::flow_manager::FlowManager;
use crate::responder::QueryResponder;
use crate::throttler::{Throttle, ThrottleLimits, Throttler};

/// Failure reported by a query engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    pub backtrace: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: String::new(),
        }
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = backtrace.into();
        self
    }
}

/// Evaluates compiled queries. Results are emitted through the responder.
///
/// Implementations should call [`Throttle::charge_op`] at their progress
/// points and stop promptly once [`QueryResponder::scope`] is cancelled.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        query: &QueryRequest,
        responder: &mut QueryResponder,
        throttle: &Throttle,
    ) -> std::result::Result<(), QueryError>;
}

/// Turns server instructions into running flows.
pub struct ClientExecutor {
    config: ClientConfig,
    manager: Arc<FlowManager>,
    engine: Arc<dyn QueryEngine>,
    throttler: Arc<Throttler>,
    output: mpsc::Sender<Message>,
    flows: TaskTracker,
}

impl ClientExecutor {
    pub fn new(
        config: ClientConfig,
        manager: Arc<FlowManager>,
        engine: Arc<dyn QueryEngine>,
        throttler: Arc<Throttler>,
        output: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            config,
            manager,
            engine,
            throttler,
            output,
            flows: TaskTracker::new(),
        }
    }

    pub fn manager(&self) -> &Arc<FlowManager> {
        &self.manager
    }

    /// Handle one message delivered by the server.
    ///
    /// Flow requests start running in the background; this returns as soon
    /// as the flow is set up.
    #[instrument(skip(self, message), fields(flow_id = %message.session_id, kind = ?message.kind()))]
    pub async fn process_request(&self, message: Message) -> Result<()> {
        let flow_id = message.session_id;
        match message.payload {
            Payload::FlowRequest(request) => {
                self.start_flow(flow_id, request);
                Ok(())
            }
            Payload::Cancel(cancel) => {
                if self.manager.cancel(&flow_id) {
                    info!(principal = %cancel.principal, "Flow cancelled by server");
                } else {
                    debug!("Flow already cancelled");
                }
                Ok(())
            }
            Payload::FlowStatsRequest(probe) => {
                self.manager.report_stats(&probe.flow_ids, &self.output).await;
                Ok(())
            }
            other => Err(FlowError::UnexpectedMessage(other.kind())),
        }
    }

    fn start_flow(&self, flow_id: String, request: FlowRequest) {
        if self.manager.flow_context(&flow_id).is_some() {
            warn!(flow_id = %flow_id, "Flow is already running, ignoring duplicate request");
            return;
        }
        if self.manager.is_cancelled(&flow_id) {
            info!(flow_id = %flow_id, "Flow was cancelled before it started");
            return;
        }

        let context = self
            .manager
            .new_flow_context(&flow_id, &request, self.output.clone(), &self.config);
        let throttle = Arc::new(self.throttler.throttle(ThrottleLimits::from(&request)));
        let timeout = (request.timeout_secs > 0).then(|| Duration::from_secs(request.timeout_secs));

        // Register every query before any of them can finish, so the flow
        // cannot look complete while queries are still being started.
        let queries: Vec<(QueryRequest, QueryResponder)> = request
            .queries
            .into_iter()
            .map(|query| {
                let (_scope, responder) = context.new_responder(&query);
                (query, responder)
            })
            .collect();

        info!(flow_id = %flow_id, queries = queries.len(), "Starting flow");

        let mut handles = Vec::with_capacity(queries.len());
        for (query, responder) in queries {
            handles.push(context.spawn(run_query(
                self.engine.clone(),
                query,
                responder,
                throttle.clone(),
                timeout,
            )));
        }

        self.flows.spawn(supervise(context, handles));
    }

    /// Wait until every started flow has been torn down.
    pub async fn wait_idle(&self) {
        self.flows.close();
        self.flows.wait().await;
        self.flows.reopen();
    }
}

async fn supervise(context: FlowContext, handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(flow_id = %context.flow_id(), error = %e, "Query task panicked");
        }
    }
    context.close().await;
    debug!(flow_id = %context.flow_id(), "Flow finished");
}

async fn run_query(
    engine: Arc<dyn QueryEngine>,
    query: QueryRequest,
    mut responder: QueryResponder,
    throttle: Arc<Throttle>,
    timeout: Option<Duration>,
) {
    let scope = responder.scope().clone();

    if throttle.wait_for_capacity(&scope).await.is_err() {
        responder.raise_error("Cancelled", "");
        return;
    }

    let execution = async {
        match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, engine.execute(&query, &mut responder, &throttle))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(QueryError::new(format!(
                        "Query timed out after {} seconds",
                        limit.as_secs()
                    ))),
                }
            }
            None => engine.execute(&query, &mut responder, &throttle).await,
        }
    };

    let result = tokio::select! {
        biased;

        _ = scope.cancelled() => Err(QueryError::new("Cancelled")),

        result = execution => result,
    };

    match result {
        Ok(()) => responder.return_ok(),
        Err(e) => responder.raise_error(e.message, e.backtrace),
    }
}
