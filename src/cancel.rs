//! Cooperative cancellation shared between a governor and its worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{SandboxError, SandboxResult};

/// Cancellation flag plus an optional wall-clock deadline.
///
/// Clones share the flag. Workers poll [`CancelToken::check`] at every
/// suspension point (line reads, child-process waits, loop iterations).
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

impl CancelToken {
    /// Token with no deadline
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
            budget: None,
        }
    }

    /// Token that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
            budget: Some(timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancelled explicitly or past the deadline
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Total budget the token was created with
    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Fail with `Timeout` once cancelled
    pub fn check(&self) -> SandboxResult<()> {
        if self.is_cancelled() {
            return Err(SandboxError::Timeout {
                duration: self.budget.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
