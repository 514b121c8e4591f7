//! Cancellation handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use stowage_types::{Result, StorageError};

/// A shared cancellation flag threaded through every driver operation.
///
/// Blocking I/O cannot be interrupted mid-read, so drivers check the token at
/// every suspension point: before each request, between pagination pages,
/// between multipart parts, and inside stream copies. A cancel observed while
/// holding a semaphore slot must release the slot before propagating.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `ABORTED` when cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::aborted());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_reflects_flag() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        let err = token.checkpoint().expect_err("cancelled");
        assert!(err.is_aborted());
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let peer = token.clone();
        peer.cancel();
        assert!(token.is_cancelled());
    }
}
