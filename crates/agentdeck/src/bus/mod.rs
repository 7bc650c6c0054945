//! Process-wide pub/sub for dashboard events.
//!
//! The bus is responsible for:
//! - Delivering published events to every subscription whose filter matches
//! - Keeping slow subscribers from ever blocking the publisher
//! - Handing out monotonic synthetic ids for events that never touch storage

mod types;

pub use types::{BusEvent, EventFilter, EventSource};

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Size of the per-subscription delivery queue.
const SUBSCRIPTION_BUFFER_SIZE: usize = 256;

/// Synthetic event ids live in `[SYNTHETIC_ID_BASE, i64::MAX)`, disjoint
/// from persisted row ids which are small positive integers.
pub const SYNTHETIC_ID_BASE: i64 = 1 << 60;

struct SubscriptionEntry {
    filter: EventFilter,
    tx: mpsc::Sender<BusEvent>,
    /// Events dropped because this subscriber's queue was full.
    dropped: AtomicU64,
}

/// Event bus fanning out to an arbitrary number of filtered subscribers.
///
/// `publish` is synchronous and never blocks: each subscription has its
/// own bounded queue, and a full queue costs that subscriber the event
/// without affecting anyone else.
pub struct EventBus {
    subscriptions: Arc<DashMap<u64, SubscriptionEntry>>,
    next_subscription_id: AtomicU64,
    next_synthetic_id: AtomicI64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            next_synthetic_id: AtomicI64::new(SYNTHETIC_ID_BASE),
        }
    }

    /// Allocate the next synthetic event id.
    pub fn next_synthetic_id(&self) -> i64 {
        self.next_synthetic_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a synthetic event stamped with a fresh id and the current time.
    pub fn make_event(
        &self,
        source: EventSource,
        event_type: impl Into<String>,
        payload: Value,
    ) -> BusEvent {
        BusEvent {
            id: self.next_synthetic_id(),
            project_id: None,
            session_id: None,
            agent_id: None,
            source,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Register a new live tap. Never blocks, and never sees events
    /// published before registration.
    pub fn subscribe(&self, filter: EventFilter) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER_SIZE);
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                filter,
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        debug!("registered bus subscription {}", id);
        Subscriber {
            id,
            subscriptions: Arc::clone(&self.subscriptions),
            rx,
        }
    }

    /// Deliver an event to every matching subscription.
    ///
    /// The subscriber set is snapshotted before delivery, so concurrent
    /// attach/detach cannot cause a subscriber to be visited twice or
    /// skipped within one publish pass.
    pub fn publish(&self, event: BusEvent) {
        let targets: Vec<(u64, mpsc::Sender<BusEvent>)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().filter.matches(&event))
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if let Some(entry) = self.subscriptions.get(&id) {
                        let total = entry.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            "subscription {} queue full, dropped event {} ({} total)",
                            id, event.id, total
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver went away without detaching; clean up.
                    self.subscriptions.remove(&id);
                    debug!("removed closed bus subscription {}", id);
                }
            }
        }
    }

    /// Number of currently attached subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle tying one consumer to its subscription.
///
/// Dropping the handle detaches the subscription synchronously; no
/// further events are delivered after drop.
pub struct Subscriber {
    id: u64,
    subscriptions: Arc<DashMap<u64, SubscriptionEntry>>,
    rx: mpsc::Receiver<BusEvent>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, or `None` once detached.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscriber {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.subscriptions.remove(&self.id).is_some() {
            debug!("removed bus subscription {}", self.id);
        }
    }
}
