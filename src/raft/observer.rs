//! FSM update events and their fan-out to subscribers.
//!
//! Components waiting for a proposal to land subscribe before proposing and
//! match the event the apply emits. Delivery never blocks the FSM for long:
//! each subscriber gets a short bounded send, slow ones are retried a few
//! times after a pause, and dropped subscriptions are skipped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::Stream;
use tracing::warn;

const SUBSCRIPTION_BUFFER: usize = 64;
const SEND_WAIT: Duration = Duration::from_millis(150);
const RETRY_PAUSE: Duration = Duration::from_millis(10);
const SEND_ROUNDS: usize = 3;

/// Kind of change to the KV map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventType {
    Set,
    Delete,
}

/// Outcome of an HA command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaEventType {
    /// Lock taken or re-taken by `holder`.
    Set,
    /// `holder` tried to take a lock held by someone else.
    TryFailed,
    /// Lock freed; `holder` is the previous owner.
    Released,
    /// `holder` tried to release a lock it does not hold.
    ReleaseFailed,
}

/// An event emitted by applying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    Kv {
        event_type: KvEventType,
        key: String,
        value: Vec<u8>,
    },
    Ha {
        event_type: HaEventType,
        key: String,
        holder: String,
    },
}

impl FsmEvent {
    pub fn kv(event_type: KvEventType, key: impl Into<String>, value: Vec<u8>) -> Self {
        FsmEvent::Kv {
            event_type,
            key: key.into(),
            value,
        }
    }

    pub fn ha(event_type: HaEventType, key: impl Into<String>, holder: impl Into<String>) -> Self {
        FsmEvent::Ha {
            event_type,
            key: key.into(),
            holder: holder.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            FsmEvent::Kv { key, .. } | FsmEvent::Ha { key, .. } => key,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<FsmEvent>>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<FsmEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<FsmEvent> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = FsmEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().senders.remove(&self.id);
        }
    }
}

/// The set of subscribers of one FSM.
#[derive(Clone, Default)]
pub struct Observers {
    registry: Arc<Mutex<Registry>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.senders.insert(id, sender);
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().senders.len()
    }

    /// Deliver `events` in order to every current subscriber.
    pub async fn notify(&self, events: &[FsmEvent]) {
        if events.is_empty() {
            return;
        }
        let senders: Vec<mpsc::Sender<FsmEvent>> =
            self.registry.lock().senders.values().cloned().collect();
        if senders.is_empty() {
            return;
        }

        for event in events {
            let mut pending = senders.clone();
            for round in 0..SEND_ROUNDS {
                let mut stragglers = Vec::new();
                for sender in pending {
                    match sender.send_timeout(event.clone(), SEND_WAIT).await {
                        Ok(()) | Err(SendTimeoutError::Closed(_)) => {}
                        Err(SendTimeoutError::Timeout(_)) => stragglers.push(sender),
                    }
                }
                pending = stragglers;
                if pending.is_empty() {
                    break;
                }
                if round + 1 < SEND_ROUNDS {
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
            if !pending.is_empty() {
                warn!(key = %event.key(), subscribers = pending.len(), "dropping fsm event for slow subscribers");
            }
        }
    }
}
