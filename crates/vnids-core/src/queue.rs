//! Bounded FIFO queue of normalized event records.
//!
//! [`EventQueue`] is a cheap cloneable handle. Ingest pushes into it and
//! IPC readers take [`Window`]s over it; every operation takes the lock
//! once and releases it before returning, so a reader never holds the
//! queue across I/O.
//!
//! Records come out in the order they were pushed, which is the order the
//! engine wrote them. That is usually timestamp order, but flow records
//! carry the flow start time and can land behind later alerts; the queue
//! never sorts, and `since` filters each record on its own timestamp.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::warn;

use vnids_config::{EventsConfig, OverflowPolicy};

use crate::event::{EventRecord, Severity};

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: Arc<EventRecord>,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<Entry>,
    next_seq: u64,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    drain_on_read: bool,
    dropped: AtomicU64,
}

/// Shared handle to the daemon's event queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    shared: Arc<Shared>,
}

impl EventQueue {
    /// A drop-newest queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::DropNewest, false)
    }

    pub fn with_policy(capacity: usize, policy: OverflowPolicy, drain_on_read: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    entries: VecDeque::with_capacity(capacity),
                    next_seq: 0,
                }),
                capacity,
                policy,
                drain_on_read,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::with_policy(
            config.queue_capacity,
            config.overflow_policy,
            config.drain_on_read,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a record. Returns `false` if it was rejected because the
    /// queue was full.
    ///
    /// Under [`OverflowPolicy::DropOldest`] the push always succeeds and
    /// the evicted record is what gets counted as dropped.
    pub fn push(&self, record: impl Into<Arc<EventRecord>>) -> bool {
        let mut inner = self.lock();
        let full = inner.entries.len() >= self.shared.capacity;

        if full && self.shared.policy == OverflowPolicy::DropNewest {
            drop(inner);
            self.note_drop();
            return false;
        }
        if full {
            inner.entries.pop_front();
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push_back(Entry {
            seq,
            record: record.into(),
        });
        drop(inner);

        if full {
            self.note_drop();
        }
        true
    }

    fn note_drop(&self) {
        let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            warn!(
                dropped,
                capacity = self.shared.capacity,
                policy = ?self.shared.policy,
                "event queue full, dropping events"
            );
        }
    }

    /// A lazy window over at most `limit` records with `timestamp >= since`,
    /// in FIFO order.
    ///
    /// The window covers only records present when it was created. Records
    /// are not removed unless the queue runs in drain mode.
    pub fn pop_window(&self, limit: usize, since: Option<DateTime<Utc>>) -> Window {
        let inner = self.lock();
        let end_seq = inner.next_seq;
        let cursor = inner.entries.front().map_or(end_seq, |e| e.seq);
        drop(inner);

        Window {
            queue: self.clone(),
            cursor,
            end_seq,
            remaining: limit,
            since,
            max_severity: None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Records rejected or evicted because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Remove every record. Called on daemon shutdown.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}

/// Finite, non-restartable iterator returned by [`EventQueue::pop_window`].
///
/// Each call to `next` takes the queue lock once. Records pushed after the
/// window was created are never yielded.
#[derive(Debug)]
pub struct Window {
    queue: EventQueue,
    cursor: u64,
    end_seq: u64,
    remaining: usize,
    since: Option<DateTime<Utc>>,
    max_severity: Option<Severity>,
}

impl Window {
    /// Only yield records whose severity is at most `max`. Records without a
    /// severity rank as informational (5).
    pub fn max_severity(mut self, max: Severity) -> Self {
        self.max_severity = Some(max);
        self
    }

    fn accepts(&self, record: &EventRecord) -> bool {
        if let Some(since) = self.since
            && record.timestamp < since
        {
            return false;
        }
        if let Some(max) = self.max_severity
            && record.effective_severity() > max
        {
            return false;
        }
        true
    }
}

impl Iterator for Window {
    type Item = Arc<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.cursor >= self.end_seq {
            return None;
        }

        let mut inner = self.queue.lock();
        let mut idx = inner.entries.partition_point(|e| e.seq < self.cursor);

        while idx < inner.entries.len() {
            let entry = &inner.entries[idx];
            if entry.seq >= self.end_seq {
                break;
            }
            self.cursor = entry.seq + 1;
            if !self.accepts(&entry.record) {
                idx += 1;
                continue;
            }

            self.remaining -= 1;
            if self.queue.shared.drain_on_read {
                return inner.entries.remove(idx).map(|e| e.record);
            }
            return Some(Arc::clone(&inner.entries[idx].record));
        }

        self.cursor = self.end_seq;
        None
    }
}

impl FusedIterator for Window {}
