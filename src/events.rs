//! Activity events: a bounded ring for the dashboard stream plus fan-out to
//! any connected WebSocket subscribers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tracing::debug;

const RING_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum EventKind {
    #[serde(rename = "client.connected")]
    #[strum(serialize = "client.connected")]
    ClientConnected,

    #[serde(rename = "client.disconnected")]
    #[strum(serialize = "client.disconnected")]
    ClientDisconnected,

    #[serde(rename = "command_executed")]
    #[strum(serialize = "command_executed")]
    CommandExecuted,

    #[serde(rename = "file_accessed")]
    #[strum(serialize = "file_accessed")]
    FileAccessed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub client_uuid: String,
    pub client_name: String,
    pub summary: String,
    #[serde(default)]
    pub data: Value,
}

/// Recent activity, newest first. Bounded so a chatty fleet can't grow the
/// server without bound.
#[derive(Clone)]
pub struct EventStore {
    ring: Arc<Mutex<AllocRingBuffer<Event>>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self {
            ring: Arc::new(Mutex::new(AllocRingBuffer::new(RING_CAPACITY))),
        }
    }
}

impl EventStore {
    pub async fn push(&self, event: Event) {
        self.ring.lock().await.push(event);
    }

    pub async fn recent(&self, limit: usize) -> Vec<Event> {
        self.ring
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Fan-out set of WebSocket subscribers. Senders that have gone away are
/// dropped inside the same critical section that discovers them.
#[derive(Clone, Default)]
pub struct Broadcast {
    senders: Arc<Mutex<HashMap<usize, UnboundedSender<String>>>>,
    next_id: Arc<AtomicUsize>,
}

impl Broadcast {
    pub async fn subscribe(&self, tx: UnboundedSender<String>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().await.insert(id, tx);

        id
    }

    pub async fn unsubscribe(&self, id: usize) {
        self.senders.lock().await.remove(&id);
    }

    pub async fn send_all(&self, message: &str) {
        let mut senders = self.senders.lock().await;

        let dead: Vec<usize> = senders
            .iter()
            .filter(|(_, tx)| tx.send(message.to_string()).is_err())
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            senders.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.senders.lock().await.len()
    }
}

/// One handle for everything that emits activity: records into the ring and
/// pushes to live subscribers.
#[derive(Clone, Default)]
pub struct Events {
    store: EventStore,
    broadcast: Broadcast,
}

impl Events {
    pub async fn record(
        &self,
        kind: EventKind,
        client_uuid: impl Into<String>,
        client_name: impl Into<String>,
        summary: impl Into<String>,
        data: Value,
    ) -> Event {
        let event = Event {
            timestamp: Utc::now(),
            kind,
            client_uuid: client_uuid.into(),
            client_name: client_name.into(),
            summary: summary.into(),
            data,
        };

        debug!(kind = %event.kind, client = %event.client_uuid, "event");

        self.store.push(event.clone()).await;

        if let Ok(text) = serde_json::to_string(&event) {
            self.broadcast.send_all(&text).await;
        }

        event
    }

    #[must_use]
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    #[must_use]
    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }
}
