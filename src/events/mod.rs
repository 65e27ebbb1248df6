//! In-process lifecycle event fan-out.
//!
//! The engine publishes node and workflow lifecycle transitions; subscribers
//! register a filter and receive matching events over a bounded channel.
//! Publishing never blocks: a subscriber whose channel is full simply misses
//! that event, and closed subscribers are pruned on the next publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Events each subscriber's channel can buffer before it starts missing.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "node:started")]
    NodeStarted,
    #[serde(rename = "node:completed")]
    NodeCompleted,
    /// Node attempt failed; a retry is scheduled.
    #[serde(rename = "node:failed")]
    NodeFailed,
    /// Node failed terminally; no further retries.
    #[serde(rename = "node:error")]
    NodeError,
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow:failed")]
    WorkflowFailed,
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled,
}

/// Event envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub execution_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            node_id: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Selects which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Events for one execution.
    Execution(String),
    /// Events for any execution of one workflow.
    Workflow(String),
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Execution(id) => event.execution_id == *id,
            EventFilter::Workflow(id) => event.workflow_id == *id,
        }
    }
}

struct SubscriberSlot {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

/// In-process publish/subscribe hub for lifecycle events.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<u64, SubscriberSlot>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a filter. Dropping the returned subscription (or
    /// calling [`EventBus::unsubscribe`]) ends delivery.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .insert(id, SubscriberSlot { filter, tx });

        Subscription { id, rx }
    }

    /// Remove a subscription by handle id.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .remove(&id);
    }

    /// Publish an event to all matching subscribers.
    ///
    /// Delivery is best-effort: a full channel drops this event for that
    /// subscriber rather than back-pressuring the publisher.
    pub fn publish(&self, event: Event) {
        // Snapshot matching senders so delivery happens outside the lock.
        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let subscribers = self.subscribers.read().expect("event bus lock poisoned");
            subscribers
                .iter()
                .filter(|(_, slot)| slot.filter.matches(&event))
                .map(|(id, slot)| (*id, slot.tx.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, "event subscriber lagging, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().expect("event bus lock poisoned");
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Current number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("event bus lock poisoned")
            .len()
    }
}

/// Handle to an event subscription.
///
/// Receive with [`Subscription::recv`]; drop to disconnect.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Subscription handle id, usable with [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next matching event; `None` once disconnected.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, execution: &str, workflow: &str) -> Event {
        Event::new(kind, execution, workflow)
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::All);

        bus.publish(
            event(EventKind::WorkflowStarted, "exec-1", "wf-1").with_payload(json!({"n": 1})),
        );

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::WorkflowStarted);
        assert_eq!(received.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_execution_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::Execution("exec-1".into()));

        bus.publish(event(EventKind::NodeCompleted, "exec-2", "wf-1"));
        bus.publish(event(EventKind::NodeCompleted, "exec-1", "wf-1"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.execution_id, "exec-1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_workflow_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::Workflow("wf-a".into()));

        bus.publish(event(EventKind::WorkflowCompleted, "exec-1", "wf-b"));
        bus.publish(event(EventKind::WorkflowCompleted, "exec-2", "wf-a"));

        assert_eq!(sub.recv().await.unwrap().execution_id, "exec-2");
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::All);
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(event(EventKind::WorkflowStarted, "exec-1", "wf-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_misses_not_blocks() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::All);

        // Overflow the channel; publish must not block or error.
        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(
                event(EventKind::NodeCompleted, "exec-1", "wf-1").with_payload(json!(i)),
            );
        }

        // Delivered events preserve publish order from the start.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload, json!(0));
    }

    #[test]
    fn test_event_envelope_serialization() {
        let ev = event(EventKind::NodeError, "exec-1", "wf-1").with_node("b");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "node:error");
        assert_eq!(json["node_id"], "b");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::All);
        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
