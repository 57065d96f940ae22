//! # Cooperative cancellation
//!
//! Every public [`crate::store::Store`] operation accepts a
//! [`CancellationToken`]. It is checked at natural suspension points:
//! candidate-set boundaries, between heap extracts in scoring loops of
//! length ≥ 1024, and between rows in dump/load. On cancellation the
//! operation returns [`crate::error::StoreError::Cancelled`] without leaving
//! partial state — writes are already inside a single transaction, and reads
//! never mutate.
//!
//! A token is cheap to clone (an `Arc<AtomicBool>` under the hood) so the
//! same token can be shared across a batch of operations and cancelled from
//! another thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cooperative cancellation flag shared between a caller and a running
/// store operation.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that can never be cancelled, for callers that don't need one.
    pub fn none() -> Self {
        Self::new()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(StoreError::Cancelled { op })` if this token has been
    /// cancelled, otherwise `Ok(())`. Call at every suspension point.
    pub fn check(&self, op: &'static str) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::StoreError::Cancelled { op })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("test").is_ok());
    }

    #[test]
    fn cancel_is_observed() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            token.check("search"),
            Err(crate::error::StoreError::Cancelled { op: "search" })
        ));
    }

    #[test]
    fn clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
