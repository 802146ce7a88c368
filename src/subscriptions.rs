//! Telemetry subscription table
//!
//! Each subscription owns a bounded queue. The receive loop only ever
//! `try_send`s into it, so a slow consumer loses its own overflow (counted and
//! logged) but never holds up decoding or other subscribers. Callback
//! subscriptions drain their queue on a dedicated task, in wire order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::types::{Telemetry, TopicId};

/// Callback invoked for every telemetry item on a subscribed topic.
pub type TelemetryCallback = Arc<dyn Fn(&Telemetry) + Send + Sync + 'static>;

/// Token returned by subscribe; pass it to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Entry {
    id: u64,
    topic: TopicId,
    tx: mpsc::Sender<Telemetry>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    entries: Vec<Entry>,
}

/// What happened to one telemetry item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Connection-scoped registry of telemetry consumers.
#[derive(Clone)]
pub struct SubscriptionTable {
    table: Arc<Mutex<Table>>,
    capacity: usize,
}

impl SubscriptionTable {
    pub fn new(capacity: usize) -> Self {
        Self { table: Arc::new(Mutex::new(Table::default())), capacity: capacity.max(1) }
    }

    /// Register a queue-backed subscription and return its receiving end.
    pub fn subscribe_channel(&self, topic: TopicId) -> (SubscriptionHandle, mpsc::Receiver<Telemetry>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push(Entry { id, topic, tx });
        debug!(subscription = id, %topic, "Subscribed");
        (SubscriptionHandle(id), rx)
    }

    /// Register a callback. It runs on its own task; a panic is logged and the
    /// subscription keeps going.
    pub fn subscribe_callback(&self, topic: TopicId, callback: TelemetryCallback) -> SubscriptionHandle {
        let (handle, mut rx) = self.subscribe_channel(topic);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&item))).is_err() {
                    warn!(subscription = handle.0, topic = %item.topic, "Telemetry callback panicked");
                }
            }
            debug!(subscription = handle.0, "Callback dispatcher finished");
        });
        handle
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|e| e.id != handle.0);
        before != table.entries.len()
    }

    /// Hand an item to every subscriber of its topic, in registration order.
    pub fn dispatch(&self, item: &Telemetry) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let mut table = self.table.lock();
        table.entries.retain(|entry| {
            if entry.topic != item.topic {
                return true;
            }
            match entry.tx.try_send(item.clone()) {
                Ok(()) => {
                    outcome.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    warn!(subscription = entry.id, topic = %item.topic, "Subscriber queue full, dropping telemetry");
                    true
                }
                // Stream consumer went away
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = entry.id, "Pruning closed subscription");
                    false
                }
            }
        });
        outcome
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
