//! Slot ownership tokens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::pool::Shared;

/// Ownership of one slot in a pool.
///
/// Release is terminal and idempotent. A released token can re-enter the
/// same pool via [`Token::reacquire`], which preserves the token's identity:
/// callers sharing it through an `Arc` observe the same handle before and
/// after a temporary release.
///
/// Dropping a held token releases its slot.
pub struct Token {
    shared: Arc<Shared>,
    id: u64,
    held: AtomicBool,
}

impl Token {
    pub(crate) fn held(shared: Arc<Shared>) -> Self {
        let id = shared.next_token_id();
        Self {
            shared,
            id,
            held: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Release the slot back to the pool. Double release is a silent no-op.
    pub fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            self.shared.release_slot();
            tracing::debug!(token = self.id, "slot released");
        }
    }

    /// Re-enter the pool on a released token, suspending until a slot is
    /// granted at the given priority. No-op on a token that is still held.
    ///
    /// The caller must be the token's sole user for the duration of the
    /// call.
    pub async fn reacquire(&self, priority: u32) {
        if self.held.load(Ordering::Acquire) {
            return;
        }
        self.shared.obtain(priority).await;
        self.held.store(true, Ordering::Release);
        tracing::debug!(token = self.id, priority, "slot reacquired");
    }

    /// Like [`Token::reacquire`] with a deadline; returns false on timeout.
    pub async fn reacquire_timeout(&self, priority: u32, timeout: Duration) -> bool {
        if self.held.load(Ordering::Acquire) {
            return true;
        }
        if self.shared.obtain_timeout(priority, timeout).await {
            self.held.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::super::SlotPool;
    use super::*;

    #[tokio::test]
    async fn release_then_reacquire_restores_held() {
        let pool = SlotPool::new(1);

        let token = pool.acquire(0).await;
        assert!(token.is_held());

        token.release();
        assert!(!token.is_held());
        assert_eq!(pool.available(), 1);

        token.reacquire(0).await;
        assert!(token.is_held());
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn reacquire_on_held_token_is_a_noop() {
        let pool = SlotPool::new(1);

        let token = pool.acquire(0).await;
        token.reacquire(0).await;

        assert!(token.is_held());
        assert_eq!(pool.available(), 0);
        token.release();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn drop_releases_the_slot() {
        let pool = SlotPool::new(1);

        {
            let _token = pool.acquire(0).await;
            assert_eq!(pool.available(), 0);
        }

        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_timeout_fails_when_pool_is_full() {
        let pool = SlotPool::new(1);

        let token = pool.acquire(0).await;
        token.release();
        let occupant = pool.acquire(0).await;

        assert!(
            !token
                .reacquire_timeout(0, Duration::from_millis(10))
                .await
        );
        assert!(!token.is_held());

        occupant.release();
        assert!(
            token
                .reacquire_timeout(0, Duration::from_millis(10))
                .await
        );
        assert!(token.is_held());
    }

    #[tokio::test]
    async fn reacquire_outranks_waiting_acquires() {
        let pool = Arc::new(SlotPool::new(1));

        let token = Arc::new(pool.acquire(0).await);
        token.release();
        let occupant = pool.acquire(0).await;

        // A fresh acquire queues at priority 0 first.
        let low = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire(0).await }
        });
        while pool.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        // The re-entering token outranks it despite arriving later.
        let high = tokio::spawn({
            let token = Arc::clone(&token);
            async move { token.reacquire(1000).await }
        });
        while pool.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        occupant.release();
        high.await.unwrap();
        assert!(token.is_held());
        assert_eq!(pool.waiting(), 1);

        token.release();
        let low_token = low.await.unwrap();
        assert!(low_token.is_held());
    }
}
