//! Synchronization primitives between API callers, the worker task, and the
//! driver's event-delivery context.
//!
//! ```text
//! ┌─────────────┐  post (block)   ┌──────────────┐
//! │ sync API    │────────────────▶│              │
//! │ async API   │── try_post ────▶│ MessageQueue │──▶ worker (recv,
//! │ translator  │── try_post ────▶│ (bounded 10) │    timed)
//! └─────────────┘                 └──────────────┘
//!       ▲                                 │
//!       └──── wait_any(mask) ◀─ set ──────┘   SyncFlags (event group)
//! ```
//!
//! Blocking producers (the sync API) may wait indefinitely for a slot;
//! zero-wait producers (the async API and the event translator) fail
//! immediately when the queue is full, preserving the translator's
//! real-time contract.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::events::Message;

// ───────────────────────────────────────────────────────────────
// Sync bits released by the worker, awaited by blocking callers
// ───────────────────────────────────────────────────────────────

pub const STARTED_BIT: u32 = 1 << 0;
pub const STOPPED_BIT: u32 = 1 << 1;
pub const CONNECTED_BIT: u32 = 1 << 2;
pub const DISCONNECTED_BIT: u32 = 1 << 3;
pub const CONNECT_FAILED_BIT: u32 = 1 << 4;
pub const START_FAILED_BIT: u32 = 1 << 5;
pub const STOP_FAILED_BIT: u32 = 1 << 6;
pub const INVALID_STATE_BIT: u32 = 1 << 7;

pub const ALL_SYNC_BITS: u32 = STARTED_BIT
    | STOPPED_BIT
    | CONNECTED_BIT
    | DISCONNECTED_BIT
    | CONNECT_FAILED_BIT
    | START_FAILED_BIT
    | STOP_FAILED_BIT
    | INVALID_STATE_BIT;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock only means another thread panicked mid-hold; the
    // protected data is a plain value and stays usable.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Bounded message queue
// ───────────────────────────────────────────────────────────────

/// Bounded multi-producer / single-consumer FIFO of [`Message`]s.
pub struct MessageQueue {
    items: Mutex<VecDeque<Message>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Zero-wait enqueue.  Returns `false` when the queue is full.
    pub fn try_post(&self, msg: Message) -> bool {
        let mut items = lock(&self.items);
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(msg);
        self.not_empty.notify_one();
        true
    }

    /// Enqueue, waiting indefinitely for a free slot.
    pub fn post(&self, msg: Message) {
        let mut items = lock(&self.items);
        while items.len() >= self.capacity {
            items = self
                .not_full
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
        items.push_back(msg);
        self.not_empty.notify_one();
    }

    /// Enqueue with a bounded wait for a free slot.
    /// Returns `false` when no slot opened up within `timeout`.
    pub fn post_timeout(&self, msg: Message, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = lock(&self.items);
        while items.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
        items.push_back(msg);
        self.not_empty.notify_one();
        true
    }

    /// Single-consumer dequeue.  `timeout` of `None` waits forever;
    /// returns `None` when the wait elapsed with the queue still empty.
    pub fn recv(&self, timeout: Option<Duration>) -> Option<Message> {
        let mut items = lock(&self.items);
        match timeout {
            None => {
                while items.is_empty() {
                    items = self
                        .not_empty
                        .wait(items)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while items.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(items, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    items = guard;
                }
            }
        }
        let msg = items.pop_front();
        self.not_full.notify_one();
        msg
    }
}

// ───────────────────────────────────────────────────────────────
// Sync flags (event group)
// ───────────────────────────────────────────────────────────────

/// A 32-bit event group: the worker releases bits, blocking callers wait
/// on them.  Waits are one-shot — the awaited bits are cleared on wake.
pub struct SyncFlags {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl SyncFlags {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Release `mask` bits and wake every waiter.
    pub fn set(&self, mask: u32) {
        let mut bits = lock(&self.bits);
        *bits |= mask;
        self.cond.notify_all();
    }

    /// Withdraw `mask` bits without waking anyone.
    pub fn clear(&self, mask: u32) {
        let mut bits = lock(&self.bits);
        *bits &= !mask;
    }

    /// Block until any bit of `mask` is set, then clear the `mask` bits and
    /// return the ones that were observed set.  Returns 0 on timeout.
    pub fn wait_any(&self, mask: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut bits = lock(&self.bits);
        loop {
            let hit = *bits & mask;
            if hit != 0 {
                *bits &= !mask;
                return hit;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(bits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            bits = guard;
        }
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
