//! Admission control for downloads and deployments.
//!
//! Two independent pools, each with a slot limit and a bounded pending
//! queue. Admission takes a free slot immediately or queues the entry;
//! freeing a slot hands it straight to the highest-priority waiter, so
//! dispatch is driven by the release itself rather than by polling.

mod queue;
mod slots;

pub use slots::{SlotPermit, SlotPool};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, Result};
use crate::types::Priority;
use queue::PendingQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Download,
    Deployment,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pool::Download => "download",
            Pool::Deployment => "deployment",
        })
    }
}

/// Result of admitting one task.
#[derive(Debug)]
pub enum Admission {
    /// A slot was free; the task may start now.
    Dispatched(SlotPermit),
    /// Queued; the receiver yields the permit when the entry is dispatched.
    Queued(oneshot::Receiver<SlotPermit>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pool: Pool,
    /// Entries waiting for a slot.
    pub depth: usize,
    /// Slots currently held.
    pub active_count: usize,
    /// Maximum queued entries.
    pub capacity: usize,
    /// Maximum concurrently held slots.
    pub limit: usize,
    /// Waiting entries in dispatch order.
    pub queued: Vec<QueuedTask>,
}

pub(crate) struct PoolShared {
    kind: Pool,
    slots: SlotPool,
    capacity: usize,
    queue: Mutex<PendingQueue>,
}

impl PoolShared {
    /// A slot came free: pass it to the best waiting entry, or release it.
    fn hand_off(shared: &Arc<Self>) {
        let mut queue = shared.queue.lock();
        loop {
            let Some(entry) = queue.pop() else {
                shared.slots.release();
                tracing::debug!(pool = %shared.kind, active = shared.slots.in_use(), "slot released");
                return;
            };
            let permit = SlotPermit::new(Arc::clone(shared));
            match entry.grant.send(permit) {
                Ok(()) => {
                    tracing::debug!(pool = %shared.kind, id = %entry.id, priority = entry.priority.as_str(), "dispatched from queue");
                    return;
                }
                Err(mut unclaimed) => {
                    // Waiter went away; the slot moves on to the next entry.
                    unclaimed.disarm();
                }
            }
        }
    }
}

pub struct Scheduler {
    downloads: Arc<PoolShared>,
    deployments: Arc<PoolShared>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let pool = |kind, limit| {
            Arc::new(PoolShared {
                kind,
                slots: SlotPool::new(limit),
                capacity: config.queue_capacity,
                queue: Mutex::new(PendingQueue::default()),
            })
        };
        Self {
            downloads: pool(Pool::Download, config.max_active_downloads),
            deployments: pool(Pool::Deployment, config.max_active_deployments),
        }
    }

    fn shared(&self, pool: Pool) -> &Arc<PoolShared> {
        match pool {
            Pool::Download => &self.downloads,
            Pool::Deployment => &self.deployments,
        }
    }

    /// Take a slot now or queue the entry. Fails with `QueueFull` without
    /// queueing anything when the pool's queue is at capacity.
    pub fn admit(&self, pool: Pool, id: Uuid, priority: Priority) -> Result<Admission> {
        let shared = self.shared(pool);
        let mut queue = shared.queue.lock();
        if queue.is_empty() && shared.slots.try_acquire() {
            tracing::debug!(pool = %pool, %id, "dispatched immediately");
            return Ok(Admission::Dispatched(SlotPermit::new(Arc::clone(shared))));
        }
        if queue.len() >= shared.capacity {
            return Err(OrchestratorError::QueueFull {
                pool,
                capacity: shared.capacity,
            });
        }
        let (tx, rx) = oneshot::channel();
        queue.push(id, priority, tx);
        tracing::debug!(pool = %pool, %id, depth = queue.len(), "queued");
        Ok(Admission::Queued(rx))
    }

    /// Drop a queued entry before dispatch. Returns whether it was queued.
    pub fn withdraw(&self, pool: Pool, id: Uuid) -> bool {
        let removed = self.shared(pool).queue.lock().remove(id);
        if removed {
            tracing::debug!(pool = %pool, %id, "withdrawn from queue");
        }
        removed
    }

    pub fn is_queued(&self, pool: Pool, id: Uuid) -> bool {
        self.shared(pool).queue.lock().contains(id)
    }

    pub fn queue_status(&self, pool: Pool) -> QueueStatus {
        let shared = self.shared(pool);
        let queue = shared.queue.lock();
        QueueStatus {
            pool,
            depth: queue.len(),
            active_count: shared.slots.in_use(),
            capacity: shared.capacity,
            limit: shared.slots.limit(),
            queued: queue
                .entries()
                .into_iter()
                .map(|(id, priority, enqueued_at)| QueuedTask {
                    id,
                    priority,
                    enqueued_at,
                })
                .collect(),
        }
    }
}
