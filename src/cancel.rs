//! Cooperative cancellation shared between the caller and running jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cloneable cancellation flag.
///
/// Cancelling does not interrupt anything by itself: the scheduler stops launching jobs and
/// transports shorten their remaining wait to [`CancelToken::grace`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    grace: Duration,
}

impl CancelToken {
    /// Default time an in-flight call may still wait once cancelled.
    pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

    /// A fresh, non-cancelled token.
    pub fn new() -> Self {
        Self::with_grace(Self::DEFAULT_GRACE)
    }

    /// A fresh token with a custom grace period.
    pub fn with_grace(grace: Duration) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            grace,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelToken::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Grace period left to in-flight calls after cancellation.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// `timeout`, shortened to the grace period when cancelled.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        if self.is_cancelled() {
            timeout.min(self.grace)
        } else {
            timeout
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
