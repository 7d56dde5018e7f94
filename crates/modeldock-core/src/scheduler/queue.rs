//! Pending entries ordered by priority, then enqueue order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::slots::SlotPermit;
use crate::types::Priority;

pub(super) struct QueueEntry {
    pub(super) id: Uuid,
    pub(super) priority: Priority,
    seq: u64,
    enqueued_at: DateTime<Utc>,
    pub(super) grant: oneshot::Sender<SlotPermit>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Max-heap order: higher priority first, then the earlier sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(super) struct PendingQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl PendingQueue {
    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(super) fn push(&mut self, id: Uuid, priority: Priority, grant: oneshot::Sender<SlotPermit>) {
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            id,
            priority,
            seq: self.next_seq,
            enqueued_at: Utc::now(),
            grant,
        });
    }

    pub(super) fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    /// Remove the entry for `id`. Returns whether one was queued.
    pub(super) fn remove(&mut self, id: Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.id != id);
        self.heap.len() != before
    }

    pub(super) fn contains(&self, id: Uuid) -> bool {
        self.heap.iter().any(|e| e.id == id)
    }

    /// `(id, priority, enqueued_at)` in dispatch order.
    pub(super) fn entries(&self) -> Vec<(Uuid, Priority, DateTime<Utc>)> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| (e.id, e.priority, e.enqueued_at))
            .collect()
    }
}
