//! Per-connection state shared between the transport and the admission core.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::slot::Token;

/// What the admission core needs from a served connection: the connection's
/// admission token, if the transport exposes one, and the keep-alive flag.
///
/// The transport inserts this (behind an `Arc`) into each request so a long
/// task can discover its connection token. A connection without a token
/// still participates in long tasks; only the slot hand-off is skipped.
pub struct ServedConnection {
    token: Option<Arc<Token>>,
    persistent: AtomicBool,
}

impl ServedConnection {
    pub fn new(token: Option<Arc<Token>>) -> Self {
        Self {
            token,
            persistent: AtomicBool::new(true),
        }
    }

    /// A connection whose transport exposes no admission token.
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn token(&self) -> Option<&Arc<Token>> {
        self.token.as_ref()
    }

    /// Whether the server may reuse this connection for further requests.
    /// Forced to false when a request on it is promoted.
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }
}
