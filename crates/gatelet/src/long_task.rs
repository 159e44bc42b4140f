//! Long-task promotion state machine.
//!
//! A request that is about to block on external I/O can promote itself: it
//! takes a slot in the (larger) long-task pool and hands its connection slot
//! back to the accept path, so the wait does not starve CPU-bound peers. On
//! demotion the exchange runs in reverse, with the re-acquire outranking
//! fresh accepts so a terminating long task always makes progress.
//!
//! Promotion is usually delayed by a short grace period so requests that
//! finish quickly never touch the long-task pool at all.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{DEMOTE_PRIORITY, PROMOTE_PRIORITY};
use crate::connection::ServedConnection;
use crate::slot::{SlotPool, Token};

tokio::task_local! {
    static CURRENT_TASK: Option<Arc<LongTask>>;
}

/// Observable promotion state. A task is never pending and promoted at the
/// same time; `stop` always returns it to idle.
enum TaskState {
    Idle,
    Pending {
        generation: u64,
        cancel: CancellationToken,
    },
    Promoted {
        token: Token,
    },
}

/// Per-request promotion handle.
///
/// Owned by the request for the request's lifetime. At most one of the
/// delayed start and the long-task token exists at any moment; state
/// transitions happen under the task's own mutex, and only slot-pool state
/// is shared across requests.
pub struct LongTask {
    pool: Arc<SlotPool>,
    connection: Option<Arc<ServedConnection>>,
    /// Borrowed from the request's connection at construction; absent when
    /// the transport exposes no admission token.
    connection_token: Option<Arc<Token>>,
    start_delay: Duration,
    state: Mutex<TaskState>,
    next_generation: AtomicU64,
}

impl LongTask {
    pub fn new(
        pool: Arc<SlotPool>,
        connection: Option<Arc<ServedConnection>>,
        start_delay: Duration,
    ) -> Self {
        let connection_token = connection.as_ref().and_then(|c| c.token().cloned());
        Self {
            pool,
            connection,
            connection_token,
            start_delay,
            state: Mutex::new(TaskState::Idle),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// True between `start` and `stop`, whether the promotion is still
    /// pending or has taken effect.
    pub fn is_started(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), TaskState::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock().unwrap(), TaskState::Pending { .. })
    }

    pub fn is_promoted(&self) -> bool {
        matches!(*self.state.lock().unwrap(), TaskState::Promoted { .. })
    }

    /// Begin promotion after the task's default delay.
    pub async fn start(self: &Arc<Self>) {
        self.start_after(self.start_delay).await;
    }

    /// Begin promotion after `delay`. Zero promotes immediately, suspending
    /// until a long-task slot is granted. Non-zero schedules a cancellable
    /// delayed promotion and returns at once. No-op if already started.
    pub async fn start_after(self: &Arc<Self>, delay: Duration) {
        let (generation, cancel) = {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, TaskState::Idle) {
                return;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            *state = TaskState::Pending {
                generation,
                cancel: cancel.clone(),
            };
            (generation, cancel)
        };

        if delay.is_zero() {
            self.promote(generation, cancel).await;
        } else {
            let task = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                task.promote(generation, cancel).await;
            });
        }
    }

    /// Acquire a long-task slot and, if it still matters, install it.
    ///
    /// `stop` may have cleared the pending state while the acquire was
    /// suspended; the freshly granted slot is then returned immediately
    /// (promoted for an instant, demoted right away) rather than leaked.
    async fn promote(&self, generation: u64, cancel: CancellationToken) {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            token = self.pool.acquire(PROMOTE_PRIORITY) => token,
        };

        let mut state = self.state.lock().unwrap();
        let still_pending = matches!(
            &*state,
            TaskState::Pending { generation: current, .. } if *current == generation
        );
        if still_pending {
            *state = TaskState::Promoted { token };
            drop(state);
            tracing::debug!("request promoted to long task");
            self.release_connection();
        } else {
            drop(state);
            token.release();
        }
    }

    /// Hand the connection slot back to the accept path. Once the slot is
    /// given up the connection must not serve further requests, or a later
    /// request on it would run with no slot at all.
    fn release_connection(&self) {
        if let Some(token) = &self.connection_token {
            token.release();
        }
        if let Some(connection) = &self.connection {
            connection.set_persistent(false);
        }
    }

    /// Demote: cancel a pending promotion or release the long-task slot,
    /// then re-acquire the connection slot at [`DEMOTE_PRIORITY`] so fresh
    /// accepts cannot starve the hand-back. Idempotent.
    pub async fn stop(&self) {
        match self.take_state() {
            TaskState::Pending { cancel, .. } => cancel.cancel(),
            TaskState::Promoted { token } => {
                token.release();
                tracing::debug!("long task demoted");
                if let Some(connection_token) = &self.connection_token {
                    connection_token.reacquire(DEMOTE_PRIORITY).await;
                }
            }
            TaskState::Idle => {}
        }
    }

    /// Terminal demotion for a connection that is going away: the long-task
    /// slot is released without re-acquiring a connection slot. Never
    /// suspends, so it is safe to call from `Drop`. Idempotent.
    pub fn stop_forced(&self) {
        match self.take_state() {
            TaskState::Pending { cancel, .. } => cancel.cancel(),
            TaskState::Promoted { token } => {
                token.release();
                tracing::debug!("long task demoted (terminal)");
            }
            TaskState::Idle => {}
        }
    }

    fn take_state(&self) -> TaskState {
        mem::replace(&mut *self.state.lock().unwrap(), TaskState::Idle)
    }

    /// Run `fut` with promotion active for its duration: start with the
    /// default delay, await the future, demote on exit. Unwinds force a
    /// terminal stop instead.
    pub async fn run<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.run_after(self.start_delay, fut).await
    }

    /// [`LongTask::run`] with an explicit delay.
    pub async fn run_after<F>(self: &Arc<Self>, delay: Duration, fut: F) -> F::Output
    where
        F: Future,
    {
        self.start_after(delay).await;
        let mut guard = StopGuard::new(self);
        let output = fut.await;
        guard.disarm();
        self.stop().await;
        output
    }

    /// Install this task as the current long task for the duration of
    /// `fut`, restoring the previous current on exit. Scopes nest.
    pub async fn with<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TASK.scope(Some(Arc::clone(self)), fut).await
    }

    /// The long task installed for the current execution context, if any.
    pub fn current() -> Option<Arc<LongTask>> {
        CURRENT_TASK.try_with(Clone::clone).unwrap_or_default()
    }
}

/// Forces a terminal stop on drop unless disarmed.
///
/// This is what guarantees slot release on every exit path: the guard rides
/// along with the response body (or the unwind) and `stop_forced` is both
/// synchronous and idempotent.
pub struct StopGuard {
    task: Option<Arc<LongTask>>,
}

impl StopGuard {
    pub fn new(task: &Arc<LongTask>) -> Self {
        Self {
            task: Some(Arc::clone(task)),
        }
    }

    pub fn disarm(&mut self) {
        self.task = None;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop_forced();
        }
    }
}
