//! Core utilities shared across the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Raised when an operation observes its cancel token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelledOperation {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline elapsed")]
    Timeout,
}

/// Cooperative cancellation token with an optional deadline.
///
/// Long-running loops (pack enumeration, delta-chain walks, alternate
/// recursion, reflog scans) poll the token between units of work and
/// unwind with [`CancelledOperation`] when it fires. Partial on-disk state
/// is confined to `.lock` files, which are removed on unwind.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn none() -> Self {
        CancelToken::default()
    }

    /// A token that fires once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Request cancellation from another thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Poll the token, failing if cancellation was requested or the
    /// deadline elapsed.
    pub fn check(&self) -> Result<(), CancelledOperation> {
        if self.flag.load(Ordering::Relaxed) {
            return Err(CancelledOperation::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CancelledOperation::Timeout);
            }
        }
        Ok(())
    }
}
