// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of flows and query scopes running on this client.
//!
//! Every query registers its cancellable scope under its flow id, so a single
//! cancel instruction from the server reaches every query of that flow no
//! matter which task it runs on. Registry mutation happens under one mutex;
//! cancelling only signals tokens and never waits for queries to exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fleetflow_protocol::{FlowRequest, FlowStats, MONITORING_FLOW_ID, Message, Payload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::flow_context::{FlowContext, FlowSettings, now_micros};

#[derive(Default)]
struct Registry {
    queries: HashMap<String, HashMap<u64, CancellationToken>>,
    contexts: HashMap<String, FlowContext>,
    cancelled: HashSet<String>,
    cancelled_order: VecDeque<String>,
    next_id: u64,
}

/// Process-wide registry of active flows. Construct one per client and
/// share it as `Arc<FlowManager>`.
pub struct FlowManager {
    registry: Mutex<Registry>,
    cancelled_history: usize,
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("active_flows", &self.active_flows())
            .finish()
    }
}

impl FlowManager {
    pub fn new() -> Arc<Self> {
        Self::with_cancelled_history(1_000)
    }

    /// Remember at most `history` cancelled flow ids.
    pub fn with_cancelled_history(history: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            cancelled_history: history.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate and register a fresh query scope for `flow_id`.
    pub fn new_query_context(self: &Arc<Self>, flow_id: &str) -> (CancellationToken, QueryCloser) {
        self.register(flow_id, CancellationToken::new())
    }

    /// Like [`new_query_context`](Self::new_query_context), with the scope
    /// also cancelled whenever `parent` is.
    pub fn new_query_context_under(
        self: &Arc<Self>,
        flow_id: &str,
        parent: &CancellationToken,
    ) -> (CancellationToken, QueryCloser) {
        self.register(flow_id, parent.child_token())
    }

    fn register(
        self: &Arc<Self>,
        flow_id: &str,
        scope: CancellationToken,
    ) -> (CancellationToken, QueryCloser) {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;

        // A query joining a flow that was already cancelled starts cancelled.
        if registry.cancelled.contains(flow_id) {
            scope.cancel();
        }
        registry
            .queries
            .entry(flow_id.to_string())
            .or_default()
            .insert(id, scope.clone());

        let closer = QueryCloser {
            manager: Arc::downgrade(self),
            flow_id: flow_id.to_string(),
            id,
        };
        (scope, closer)
    }

    fn deregister(&self, flow_id: &str, id: u64) {
        let mut registry = self.lock();
        if let Some(scopes) = registry.queries.get_mut(flow_id) {
            scopes.remove(&id);
            if scopes.is_empty() {
                registry.queries.remove(flow_id);
            }
        }
    }

    /// Cancel every query of `flow_id`.
    ///
    /// Returns true if this call cancelled the flow, false if it was already
    /// cancelled or is the monitoring flow.
    pub fn cancel(&self, flow_id: &str) -> bool {
        if flow_id == MONITORING_FLOW_ID {
            debug!(flow_id, "Ignoring cancel for the monitoring flow");
            return false;
        }

        let (scopes, context) = {
            let mut registry = self.lock();
            if !registry.cancelled.insert(flow_id.to_string()) {
                return false;
            }
            registry.cancelled_order.push_back(flow_id.to_string());
            while registry.cancelled_order.len() > self.cancelled_history {
                if let Some(old) = registry.cancelled_order.pop_front() {
                    registry.cancelled.remove(&old);
                }
            }

            let scopes: Vec<CancellationToken> = registry
                .queries
                .get(flow_id)
                .map(|s| s.values().cloned().collect())
                .unwrap_or_default();
            (scopes, registry.contexts.get(flow_id).cloned())
        };

        for scope in &scopes {
            scope.cancel();
        }
        if let Some(context) = context {
            context.cancel();
        }

        info!(flow_id, queries = scopes.len(), "Cancelled flow");
        true
    }

    pub fn is_cancelled(&self, flow_id: &str) -> bool {
        self.lock().cancelled.contains(flow_id)
    }

    /// Number of registered query scopes for `flow_id`.
    pub fn active_queries(&self, flow_id: &str) -> usize {
        self.lock().queries.get(flow_id).map_or(0, HashMap::len)
    }

    /// Create and register the context for a newly dispatched flow.
    pub fn new_flow_context(
        self: &Arc<Self>,
        flow_id: &str,
        request: &FlowRequest,
        output: mpsc::Sender<Message>,
        config: &ClientConfig,
    ) -> FlowContext {
        let settings = FlowSettings::from_request(request, config);
        let context =
            FlowContext::with_owner(flow_id.to_string(), settings, output, Arc::downgrade(self));
        self.lock()
            .contexts
            .insert(flow_id.to_string(), context.clone());
        context
    }

    pub fn flow_context(&self, flow_id: &str) -> Option<FlowContext> {
        self.lock().contexts.get(flow_id).cloned()
    }

    pub(crate) fn remove_flow_context(&self, flow_id: &str) {
        self.lock().contexts.remove(flow_id);
    }

    /// Ids of flows with a live context.
    pub fn active_flows(&self) -> Vec<String> {
        let mut flows: Vec<String> = self.lock().contexts.keys().cloned().collect();
        flows.sort();
        flows
    }

    /// Answer a server probe about in-flight flows.
    ///
    /// Known flows report through their aggregator; unknown flows get an
    /// "unknown flow" report so the server stops waiting for them.
    pub async fn report_stats(&self, flow_ids: &[String], output: &mpsc::Sender<Message>) {
        for flow_id in flow_ids {
            match self.flow_context(flow_id) {
                Some(context) => context.report_stats(),
                None => {
                    debug!(flow_id = %flow_id, "Reporting unknown flow");
                    let report = Message::new(
                        flow_id.clone(),
                        Payload::FlowStats(FlowStats::unknown_flow(now_micros())),
                    );
                    if output.send(report).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Deregisters one query scope when closed or dropped.
#[derive(Debug)]
pub struct QueryCloser {
    manager: Weak<FlowManager>,
    flow_id: String,
    id: u64,
}

impl QueryCloser {
    pub fn close(self) {
        // Work happens in Drop.
    }
}

impl Drop for QueryCloser {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(&self.flow_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closers_remove_flow_entry() {
        let manager = FlowManager::new();
        let (_a, closer_a) = manager.new_query_context("F.1");
        let (_b, closer_b) = manager.new_query_context("F.1");
        assert_eq!(manager.active_queries("F.1"), 2);

        closer_a.close();
        assert_eq!(manager.active_queries("F.1"), 1);

        drop(closer_b);
        assert_eq!(manager.active_queries("F.1"), 0);
        assert!(manager.lock().queries.is_empty());
    }

    #[test]
    fn test_cancel_reaches_every_scope_once() {
        let manager = FlowManager::new();
        let (a, _ca) = manager.new_query_context("F.1");
        let (b, _cb) = manager.new_query_context("F.1");
        let (other, _co) = manager.new_query_context("F.2");

        assert!(manager.cancel("F.1"));
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!other.is_cancelled());

        assert!(!manager.cancel("F.1"));
        assert!(manager.is_cancelled("F.1"));
    }

    #[test]
    fn test_monitoring_flow_is_never_cancelled() {
        let manager = FlowManager::new();
        let (scope, _closer) = manager.new_query_context(MONITORING_FLOW_ID);

        assert!(!manager.cancel(MONITORING_FLOW_ID));
        assert!(!scope.is_cancelled());
        assert!(!manager.is_cancelled(MONITORING_FLOW_ID));
    }

    #[test]
    fn test_late_query_joins_cancelled() {
        let manager = FlowManager::new();
        assert!(manager.cancel("F.1"));

        let (scope, _closer) = manager.new_query_context("F.1");
        assert!(scope.is_cancelled());
    }

    #[test]
    fn test_cancelled_history_is_bounded() {
        let manager = FlowManager::with_cancelled_history(2);
        manager.cancel("F.1");
        manager.cancel("F.2");
        manager.cancel("F.3");

        assert!(!manager.is_cancelled("F.1"));
        assert!(manager.is_cancelled("F.2"));
        assert!(manager.is_cancelled("F.3"));
    }

    #[tokio::test]
    async fn test_unknown_flow_probe() {
        let manager = FlowManager::new();
        let (tx, mut rx) = mpsc::channel(4);

        manager.report_stats(&["F.gone".to_string()], &tx).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.session_id, "F.gone");
        let Payload::FlowStats(stats) = msg.payload else {
            panic!("expected stats");
        };
        assert!(stats.flow_complete);
        assert_eq!(
            stats.query_status[0].status,
            fleetflow_protocol::StatusCode::UnknownFlow
        );
    }
}
