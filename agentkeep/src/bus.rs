//! Event Bus: fan-out of newly appended events to live subscribers.
//!
//! Grounded on the teacher's streaming path (`stream::StreamAggregator`
//! consuming a channel of chunks) generalized from one stream per run to
//! many: each subscriber gets its own bounded `tokio::sync::mpsc` channel: a
//! slow subscriber drops its own newest events rather than blocking the
//! publisher or other subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Result;
use crate::ids::{EventId, RunId};
use crate::scope::Scope;
use crate::store::{EventLog, EventPage, NewEvent};
use crate::types::{Event, PendingApproval};

/// Per-run, per-subscriber event fan-out.
///
/// Subscribers that stop polling (or are dropped) are pruned lazily on the
/// next publish to that run rather than tracked via an explicit unsubscribe
/// call.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<HashMap<RunId, Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    /// Build a bus whose per-subscriber channels hold up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `run_id`'s events, returning a stream of its future
    /// publications, composable with `StreamExt` combinators rather than a
    /// raw channel half.
    #[must_use]
    pub fn subscribe(&self, run_id: &RunId) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        let mut subs = self.subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.entry(run_id.clone()).or_default().push(tx);
        ReceiverStream::new(rx)
    }

    /// Publish one event to every live subscriber of its run.
    ///
    /// Uses `try_send` rather than `send`: a subscriber that isn't keeping
    /// up drops this event instead of stalling the publisher. Closed
    /// senders are pruned from the subscriber list.
    pub fn publish(&self, event: &Event) {
        let mut subs = self.subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(senders) = subs.get_mut(&event.run_id) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            subs.remove(&event.run_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUS_CAPACITY)
    }
}

/// Wraps an [`EventLog`] so every successful append also publishes to an
/// [`EventBus`], giving live subscribers the same events as the durable log
/// without threading a bus handle through the Agent Loop, Tool Scheduler, or
/// Swarm Coordinator: they keep depending on `Arc<dyn EventLog>` exactly as
/// before, and the caller who wires the runtime together decides whether that
/// trait object is a bare store or one of these.
pub struct BusEventLog {
    inner: Arc<dyn EventLog>,
    bus: Arc<EventBus>,
}

impl BusEventLog {
    /// Wrap `inner` so its appends also fan out through `bus`.
    #[must_use]
    pub const fn new(inner: Arc<dyn EventLog>, bus: Arc<EventBus>) -> Self {
        Self { inner, bus }
    }

    fn to_event(new_event: &NewEvent, id: EventId) -> Event {
        Event {
            id,
            run_id: new_event.run_id.clone(),
            ts: chrono::Utc::now(),
            agent_id: new_event.agent_id.clone(),
            step_id: new_event.step_id,
            span_id: new_event.span_id.clone(),
            parent_span_id: new_event.parent_span_id.clone(),
            payload: new_event.payload.clone(),
            v: 1,
            redaction: new_event.redaction.clone(),
            group_id: new_event.group_id.clone(),
        }
    }
}

#[async_trait]
impl EventLog for BusEventLog {
    async fn append_one(&self, event: NewEvent) -> Result<EventId> {
        let id = self.inner.append_one(event.clone()).await?;
        self.bus.publish(&Self::to_event(&event, id));
        Ok(id)
    }

    async fn append_many(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>> {
        let ids = self.inner.append_many(events.clone()).await?;
        for (event, &id) in events.iter().zip(&ids) {
            self.bus.publish(&Self::to_event(event, id));
        }
        Ok(ids)
    }

    async fn read_page(
        &self,
        run_id: &RunId,
        scope: &Scope,
        after_id: Option<EventId>,
        limit: usize,
        exclude_types: &[&str],
    ) -> Result<EventPage> {
        self.inner.read_page(run_id, scope, after_id, limit, exclude_types).await
    }

    async fn pending_approvals(&self, run_id: &RunId, scope: &Scope) -> Result<Vec<PendingApproval>> {
        self.inner.pending_approvals(run_id, scope).await
    }
}
