// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-client task queues and in-flight flow tracking.
//!
//! Messages for a client wait in its queue until the client next polls.
//! New flows are handed out only while the client has room: a client runs at
//! most `max_in_flight` flows, and the rest stay queued. Flows handed out are
//! tracked until their final report arrives, and stale entries are probed
//! with a `FlowStatsRequest` so a crashed client cannot pin its slots.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetflow_protocol::{FlowStatsRequest, Message, MessageKind, Payload, STATUS_CHECK_FLOW_ID};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collection_context::FlowState;
use crate::config::Config;
use crate::flow_store::FlowStore;
use crate::journal::{CLIENT_SCHEDULED_QUEUE, Journal};

#[derive(Debug, Clone)]
struct InFlight {
    last_activity: DateTime<Utc>,
    last_checked: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ClientRecord {
    queue: VecDeque<Message>,
    in_flight: HashMap<String, InFlight>,
}

pub struct ClientInfoManager {
    flow_store: Arc<FlowStore>,
    journal: Arc<dyn Journal>,
    /// None disables both the dispatch limit and in-flight probes.
    max_in_flight: Option<usize>,
    check_interval: chrono::Duration,
    clients: Mutex<HashMap<String, ClientRecord>>,
}

impl std::fmt::Debug for ClientInfoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInfoManager")
            .field("max_in_flight", &self.max_in_flight)
            .field("check_interval", &self.check_interval)
            .field("journal", &"...")
            .finish()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl ClientInfoManager {
    pub fn new(config: &Config, flow_store: Arc<FlowStore>, journal: Arc<dyn Journal>) -> Self {
        Self {
            flow_store,
            journal,
            max_in_flight: (!config.disable_inflight_checks).then(|| config.max_in_flight()),
            check_interval: to_chrono(config.inflight_check_interval()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientRecord>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a message for delivery on the client's next poll.
    pub fn queue_message(&self, client_id: &str, message: Message) {
        debug!(client_id, flow_id = %message.session_id, kind = ?message.kind(), "Queueing message");
        self.clients()
            .entry(client_id.to_string())
            .or_default()
            .queue
            .push_back(message);
    }

    /// Messages waiting for the client, without removing them.
    pub fn peek_tasks(&self, client_id: &str) -> Vec<Message> {
        self.clients()
            .get(client_id)
            .map(|c| c.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop queued messages for one flow. Returns how many were dropped.
    pub fn remove_tasks_for_flow(&self, client_id: &str, flow_id: &str) -> usize {
        let mut clients = self.clients();
        let Some(client) = clients.get_mut(client_id) else {
            return 0;
        };
        let before = client.queue.len();
        client.queue.retain(|m| m.session_id != flow_id);
        before - client.queue.len()
    }

    /// Messages to send the client now.
    pub async fn get_client_tasks(&self, client_id: &str) -> Vec<Message> {
        self.get_client_tasks_at(client_id, Utc::now()).await
    }

    /// [`get_client_tasks`](Self::get_client_tasks) at an explicit time.
    pub async fn get_client_tasks_at(&self, client_id: &str, now: DateTime<Utc>) -> Vec<Message> {
        let (mut tasks, scheduled, stale) = self.take_tasks(client_id, now);

        if !stale.is_empty() {
            let probe = self.verify_in_flight(client_id, stale, now).await;
            if !probe.is_empty() {
                debug!(client_id, flows = ?probe, "Probing in-flight flows");
                tasks.push(Message::new(
                    STATUS_CHECK_FLOW_ID,
                    Payload::FlowStatsRequest(FlowStatsRequest { flow_ids: probe }),
                ));
            }
        }

        for flow_id in &scheduled {
            self.mark_waiting(client_id, flow_id, now).await;
        }
        tasks
    }

    fn take_tasks(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> (Vec<Message>, Vec<String>, Vec<String>) {
        let mut clients = self.clients();
        let Some(client) = clients.get_mut(client_id) else {
            return Default::default();
        };

        let mut budget = self
            .max_in_flight
            .map(|max| max.saturating_sub(client.in_flight.len()));
        let mut tasks = Vec::new();
        let mut scheduled = Vec::new();
        let mut held = VecDeque::new();

        while let Some(message) = client.queue.pop_front() {
            if message.kind() != MessageKind::FlowRequest {
                tasks.push(message);
                continue;
            }
            if budget == Some(0) {
                held.push_back(message);
                continue;
            }
            if let Some(remaining) = budget.as_mut() {
                *remaining -= 1;
            }
            client.in_flight.insert(
                message.session_id.clone(),
                InFlight {
                    last_activity: now,
                    last_checked: now,
                },
            );
            scheduled.push(message.session_id.clone());
            tasks.push(message);
        }
        client.queue = held;
        if !client.queue.is_empty() {
            debug!(client_id, held = client.queue.len(), "Client at flow limit, holding requests");
        }

        let stale = if self.max_in_flight.is_some() {
            client
                .in_flight
                .iter()
                .filter(|(id, entry)| {
                    !scheduled.contains(*id) && now - entry.last_checked > self.check_interval
                })
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            Vec::new()
        };
        (tasks, scheduled, stale)
    }

    /// Drop entries whose record is final. Returns the flows left to probe.
    async fn verify_in_flight(
        &self,
        client_id: &str,
        stale: Vec<String>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut finished = Vec::new();
        let mut probe = Vec::new();
        for flow_id in stale {
            match self.flow_store.load(client_id, &flow_id).await {
                Ok(Some(ctx)) if ctx.state.is_terminal() => finished.push(flow_id),
                Ok(None) => finished.push(flow_id),
                Ok(Some(_)) => probe.push(flow_id),
                Err(e) => {
                    warn!(client_id, flow_id = %flow_id, error = %e, "Cannot verify in-flight flow");
                    probe.push(flow_id);
                }
            }
        }

        let mut clients = self.clients();
        if let Some(client) = clients.get_mut(client_id) {
            for flow_id in &finished {
                client.in_flight.remove(flow_id);
            }
            for flow_id in &probe {
                if let Some(entry) = client.in_flight.get_mut(flow_id) {
                    entry.last_checked = now;
                }
            }
        }
        probe.sort();
        probe
    }

    async fn mark_waiting(&self, client_id: &str, flow_id: &str, now: DateTime<Utc>) {
        let result = self
            .flow_store
            .modify(client_id, flow_id, |ctx| {
                if ctx.state == FlowState::Running {
                    ctx.state = FlowState::Waiting;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(client_id, flow_id, error = %e, "Failed to mark flow as waiting");
        }

        let row = json!({
            "ClientId": client_id,
            "FlowId": flow_id,
            "Timestamp": now.timestamp(),
        });
        if let Err(e) = self.journal.push_rows(CLIENT_SCHEDULED_QUEUE, vec![row]).await {
            warn!(client_id, flow_id, error = %e, "Failed to publish scheduled flow");
        }
    }

    /// Note that the client sent something for the flow.
    pub fn flow_activity(&self, client_id: &str, flow_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self
            .clients()
            .get_mut(client_id)
            .and_then(|c| c.in_flight.get_mut(flow_id))
        {
            entry.last_activity = now;
        }
    }

    /// The flow reached its final state; free its slot.
    pub fn flow_completed(&self, client_id: &str, flow_id: &str) {
        if let Some(client) = self.clients().get_mut(client_id) {
            client.in_flight.remove(flow_id);
        }
    }

    /// Flows currently in flight for the client, sorted.
    pub fn in_flight(&self, client_id: &str) -> Vec<String> {
        let mut flows: Vec<String> = self
            .clients()
            .get(client_id)
            .map(|c| c.in_flight.keys().cloned().collect())
            .unwrap_or_default();
        flows.sort();
        flows
    }

    /// Mark flows with no activity for `timeout` as UNRESPONSIVE.
    ///
    /// Returns the (client, flow) pairs that changed state.
    pub async fn check_unresponsive(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> crate::error::Result<Vec<(String, String)>> {
        let timeout = to_chrono(timeout);
        let idle: Vec<(String, String)> = self
            .clients()
            .iter()
            .flat_map(|(client_id, client)| {
                client
                    .in_flight
                    .iter()
                    .filter(|(_, entry)| now - entry.last_activity > timeout)
                    .map(move |(flow_id, _)| (client_id.clone(), flow_id.clone()))
            })
            .collect();

        let mut marked = Vec::new();
        for (client_id, flow_id) in idle {
            let (_, changed) = self
                .flow_store
                .modify(&client_id, &flow_id, |ctx| ctx.mark_unresponsive())
                .await?;
            if changed {
                info!(client_id = %client_id, flow_id = %flow_id, "Flow is unresponsive");
                marked.push((client_id, flow_id));
            }
        }
        marked.sort();
        Ok(marked)
    }
}
