//! Slot pools and ownership tokens.
//!
//! A pool is a bounded set of interchangeable slots with priority-ordered
//! waiting. Tokens are identity-preserving handles: release is terminal and
//! idempotent, and a released token can re-enter its pool at a chosen
//! priority without losing its identity.

mod pool;
mod token;

pub use pool::SlotPool;
pub use token::Token;
