//! Bounded slot pool with priority-ordered waiting.
//!
//! Waiters are served strictly by priority, FIFO within equal priority. A
//! released slot is handed directly to the best waiter without ever becoming
//! visible as available, so a release that arrives during a waiter's
//! suspension counts toward that waiter and cannot be lost to a later
//! arrival.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::stats::PoolSnapshot;

use super::token::Token;

/// Waiters order by priority descending, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaiterKey {
    priority: Reverse<u32>,
    seq: u64,
}

struct State {
    available: usize,
    waiters: BTreeMap<WaiterKey, oneshot::Sender<()>>,
    next_seq: u64,
}

pub(crate) struct Shared {
    capacity: usize,
    state: Mutex<State>,
    next_token_id: AtomicU64,
}

impl Shared {
    /// Return one slot to the pool: hand it to the best waiter if there is
    /// one, otherwise make it available again.
    pub(crate) fn release_slot(&self) {
        let mut state = self.state.lock().unwrap();
        self.release_locked(&mut state);
    }

    fn release_locked(&self, state: &mut State) {
        while let Some((_, waiter)) = state.waiters.pop_first() {
            // The grant must be sent under the lock: a cancelled waiter
            // deregisters under the same lock and checks its channel for a
            // parked grant, so the grant is either observed or still queued,
            // never in flight.
            if waiter.send(()).is_ok() {
                return;
            }
            // Receiver already gone (timed out or cancelled); next waiter.
        }
        state.available += 1;
        debug_assert!(state.available <= self.capacity);
    }

    /// Take a slot if one is free, otherwise enqueue as a waiter. Both
    /// happen under a single lock acquisition: a release landing between a
    /// failed take and the enqueue would otherwise surface the slot as
    /// available while this caller parks, letting a later arrival steal it
    /// out of order (or strand this caller forever).
    ///
    /// Returns `None` when the slot was taken directly.
    fn take_or_register(&self, priority: u32) -> Option<(WaiterKey, oneshot::Receiver<()>)> {
        let mut state = self.state.lock().unwrap();
        if state.available > 0 {
            state.available -= 1;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let key = WaiterKey {
            priority: Reverse(priority),
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.waiters.insert(key, tx);
        Some((key, rx))
    }

    /// Take ownership of one slot, suspending until one is granted.
    ///
    /// Cancel safe: dropping the future deregisters the waiter and returns
    /// any slot that was handed off concurrently.
    pub(crate) async fn obtain(&self, priority: u32) {
        loop {
            let Some((key, rx)) = self.take_or_register(priority) else {
                return;
            };
            let mut wait = SlotWait {
                shared: self,
                key,
                rx,
                granted: false,
            };
            if wait.recv().await {
                return;
            }
            // Sender vanished without a grant; re-enter the queue.
        }
    }

    pub(crate) async fn obtain_timeout(&self, priority: u32, timeout: Duration) -> bool {
        let Some((key, rx)) = self.take_or_register(priority) else {
            return true;
        };
        let mut wait = SlotWait {
            shared: self,
            key,
            rx,
            granted: false,
        };
        matches!(tokio::time::timeout(timeout, wait.recv()).await, Ok(true))
    }

    pub(crate) fn try_obtain(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn next_token_id(&self) -> u64 {
        self.next_token_id.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().unwrap();
        PoolSnapshot {
            capacity: self.capacity,
            available: state.available,
            waiting: state.waiters.len(),
        }
    }
}

/// A registered waiter. Dropping it deregisters the waiter and restores a
/// grant that raced with the cancellation.
struct SlotWait<'a> {
    shared: &'a Shared,
    key: WaiterKey,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl SlotWait<'_> {
    async fn recv(&mut self) -> bool {
        if (&mut self.rx).await.is_ok() {
            self.granted = true;
            true
        } else {
            false
        }
    }
}

impl Drop for SlotWait<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        if state.waiters.remove(&self.key).is_some() {
            return;
        }
        // Deregistered by a release: the grant is parked in the channel.
        if self.rx.try_recv().is_ok() {
            self.shared.release_locked(&mut state);
        }
    }
}

/// Bounded pool of interchangeable slot tokens with priority-ordered
/// waiting.
///
/// The internal counter and waiter set are guarded by a single mutex; all
/// critical sections are non-suspending. Suspension happens outside the
/// lock on a per-waiter hand-off channel.
pub struct SlotPool {
    shared: Arc<Shared>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(State {
                    available: capacity,
                    waiters: BTreeMap::new(),
                    next_seq: 0,
                }),
                next_token_id: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a slot, suspending for as long as necessary.
    pub async fn acquire(&self, priority: u32) -> Token {
        self.shared.obtain(priority).await;
        Token::held(Arc::clone(&self.shared))
    }

    /// Acquire a slot with a deadline. Returns `None` on timeout; this is
    /// the only failure mode a pool has.
    pub async fn acquire_timeout(&self, priority: u32, timeout: Duration) -> Option<Token> {
        if self.shared.obtain_timeout(priority, timeout).await {
            Some(Token::held(Arc::clone(&self.shared)))
        } else {
            None
        }
    }

    /// Acquire only if a slot is immediately available.
    pub fn try_acquire(&self) -> Option<Token> {
        self.shared
            .try_obtain()
            .then(|| Token::held(Arc::clone(&self.shared)))
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().unwrap().available
    }

    /// Number of callers currently suspended in `acquire`.
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().unwrap().waiters.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.shared.snapshot()
    }
}
