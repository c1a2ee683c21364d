//! Query Cancellation
//!
//! Cooperative cancellation and deadline enforcement for query
//! evaluation.
//!
//! ## Design
//!
//! Uses a combination of:
//! - Atomic flag for cooperative cancellation
//! - Optional deadline checked alongside the flag
//!
//! The evaluator checks the token at every rule entry and periodically
//! between expressions; blocking built-ins check it around I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation error carrying timing detail.
#[derive(Debug, Clone)]
pub struct CancelError {
    /// The deadline that was exceeded, if one was set
    pub timeout: Option<Duration>,
    /// How long the query actually ran
    pub elapsed: Duration,
}

impl std::fmt::Display for CancelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.timeout {
            Some(timeout) => write!(
                f,
                "query exceeded deadline of {:?} (ran for {:?})",
                timeout, self.elapsed
            ),
            None => write!(f, "query cancelled after {:?}", self.elapsed),
        }
    }
}

impl std::error::Error for CancelError {}

/// Cancellation token for one query.
///
/// Can be shared across threads and checked periodically; cancelling
/// from a [`CancelHandle`] stops the owning evaluation at its next
/// check.
#[derive(Clone)]
pub struct Cancellation {
    /// Cancellation flag (shared across threads)
    cancelled: Arc<AtomicBool>,

    /// When the query started
    start_time: Instant,

    /// Maximum allowed duration
    deadline: Option<Duration>,
}

impl Cancellation {
    /// Create a token with the specified deadline.
    pub fn new(deadline: Option<Duration>) -> Self {
        Cancellation {
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
            deadline,
        }
    }

    /// A token that never expires on its own.
    pub fn unbounded() -> Self {
        Cancellation::new(None)
    }

    /// Check whether evaluation may continue.
    ///
    /// Returns `Ok(())` to continue, or `Err(CancelError)` when the
    /// query was cancelled or its deadline passed.
    pub fn check(&self) -> Result<(), CancelError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(CancelError {
                timeout: self.deadline,
                elapsed: self.start_time.elapsed(),
            });
        }

        if let Some(deadline) = self.deadline {
            let elapsed = self.start_time.elapsed();
            if elapsed > deadline {
                self.cancelled.store(true, Ordering::Relaxed);
                return Err(CancelError {
                    timeout: Some(deadline),
                    elapsed,
                });
            }
        }

        Ok(())
    }

    /// Cancel explicitly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Remaining time before the deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            let elapsed = self.start_time.elapsed();
            if elapsed >= deadline {
                Duration::ZERO
            } else {
                deadline - elapsed
            }
        })
    }

    /// A handle for cancelling from another thread.
    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::unbounded()
    }
}

/// Handle for cancelling a query from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unbounded() {
        let cancel = Cancellation::unbounded();
        assert!(cancel.check().is_ok());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_deadline_not_exceeded() {
        let cancel = Cancellation::new(Some(Duration::from_secs(10)));
        assert!(cancel.check().is_ok());
    }

    #[test]
    fn test_explicit_cancellation() {
        let cancel = Cancellation::unbounded();
        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert!(cancel.check().is_err());
    }

    #[test]
    fn test_cancel_handle() {
        let cancel = Cancellation::unbounded();
        let handle = cancel.handle();

        handle.cancel();

        assert!(cancel.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_deadline_exceeded() {
        let cancel = Cancellation::new(Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(50));

        let result = cancel.check();
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.elapsed >= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_remaining_time() {
        let cancel = Cancellation::new(Some(Duration::from_secs(10)));
        let remaining = cancel.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
    }
}
