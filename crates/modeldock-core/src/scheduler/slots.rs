//! Bounded slot counter and the RAII permit that holds one slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Pool, PoolShared};

/// Slots currently held against a fixed limit.
#[derive(Debug)]
pub struct SlotPool {
    limit: usize,
    in_use: AtomicUsize,
}

impl SlotPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Take one slot if any is free.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current >= self.limit {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// One held slot. Dropping it hands the slot to the next queued entry, or
/// frees it when the queue is empty.
#[must_use = "dropping the permit frees the slot"]
pub struct SlotPermit {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl SlotPermit {
    pub(super) fn new(shared: Arc<PoolShared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    pub fn pool(&self) -> Pool {
        self.shared.kind
    }

    /// Used when a hand-off fails and the slot moves on to another entry.
    pub(super) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").field("pool", &self.shared.kind).finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.armed {
            PoolShared::hand_off(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_limit() {
        let pool = SlotPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert_eq!(pool.in_use(), 2);
        pool.release();
        assert!(pool.try_acquire());
        pool.release();
        pool.release();
        pool.release();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.limit(), 1);
        assert!(pool.try_acquire());
    }

    #[test]
    fn concurrent_acquire_never_exceeds_limit() {
        let pool = Arc::new(SlotPool::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.try_acquire())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 3);
        assert_eq!(pool.in_use(), 3);
    }
}
