//! Fan-out of ingested events to in-process subscribers.
//!
//! Ingest publishes every parsed record once; each [`Subscription`] sees
//! the records that pass its [`EventFilter`]. Delivery is a bounded
//! broadcast: a subscriber that falls more than the channel capacity
//! behind loses the oldest records it missed, and the loss is counted
//! rather than slowing ingest down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::event::{EventKind, EventRecord, Severity};

/// Records buffered per subscriber before the slowest one starts losing them.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Which records a subscriber wants. The default passes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: Option<EventKind>,
    /// Pass only records at least this severe (numerically at most).
    pub severity_max: Option<Severity>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, kind: EventKind) -> Self {
        self.event_type = Some(kind);
        self
    }

    pub fn severity_max(mut self, max: Severity) -> Self {
        self.severity_max = Some(max);
        self
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        if let Some(kind) = &self.event_type
            && record.event_type != *kind
        {
            return false;
        }
        if let Some(max) = self.severity_max
            && record.effective_severity() > max
        {
            return false;
        }
        true
    }
}

/// Publishing side, held by ingest.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<Arc<EventRecord>>,
    lagged: Arc<AtomicU64>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand `record` to every current subscriber. Returns how many there were.
    pub fn publish(&self, record: Arc<EventRecord>) -> usize {
        self.tx.send(record).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
            lagged: Arc::clone(&self.lagged),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Records lost by subscribers that fell behind, summed over all of them.
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// Receiving side of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Arc<EventRecord>>,
    filter: EventFilter,
    lagged: Arc<AtomicU64>,
}

impl Subscription {
    /// Next matching record. `None` once every dispatcher handle is gone.
    pub async fn recv(&mut self) -> Option<Arc<EventRecord>> {
        loop {
            match self.rx.recv().await {
                Ok(record) if self.filter.matches(&record) => return Some(record),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => self.note_lag(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Up to `max` matching records already waiting, without blocking.
    pub fn drain_ready(&mut self, max: usize, into: &mut Vec<Arc<EventRecord>>) {
        let mut taken = 0;
        while taken < max {
            match self.rx.try_recv() {
                Ok(record) if self.filter.matches(&record) => {
                    into.push(record);
                    taken += 1;
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => self.note_lag(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return,
            }
        }
    }

    fn note_lag(&self, missed: u64) {
        warn!(missed, "event subscriber fell behind, records skipped");
        self.lagged.fetch_add(missed, Ordering::Relaxed);
    }
}
