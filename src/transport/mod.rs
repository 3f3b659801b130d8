//! Access to the analysis engine.
//!
//! A [`Transport`] sends one [`Query`] and waits for the one response carrying the same id.
//! Two implementations are provided:
//!
//! - [`ProcessTransport`]: a long-lived engine subprocess spoken to over its stdin/stdout
//! - [`HttpTransport`]: an engine behind `POST /analyze`, with retries and optional
//!   bearer authentication
//!
//! Transports are stateful and used by one caller at a time. Code that needs several of them
//! (the batch scheduler) receives a [`TransportFactory`] instead.

use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::protocol::{AnalysisResult, Query};

mod http;
mod process;

pub use http::{HealthStatus, HttpConfig, HttpTransport, RetryPolicy};
pub use process::{ProcessConfig, ProcessTransport};

/// Why a call did not produce an [`AnalysisResult`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The engine could not be reached: process dead or never started, connection refused.
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    /// No matching response within the allotted time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Something came back for this query but could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The engine answered with a protocol-level error.
    #[error("engine rejected query: {0}")]
    EngineRejected(String),
}

impl TransportError {
    /// Short stable name, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Unreachable(_) => "unreachable",
            TransportError::Timeout(_) => "timeout",
            TransportError::MalformedResponse(_) => "malformed_response",
            TransportError::EngineRejected(_) => "engine_rejected",
        }
    }
}

/// Send one query, receive one response.
pub trait Transport: Send {
    /// Send `query` and wait up to `timeout` for the response whose id matches.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`]. A successful call may still carry a degenerate result
    /// (`visits == 0`); deciding what to do with it is up to the caller.
    fn send(&mut self, query: &Query, timeout: Duration) -> Result<AnalysisResult, TransportError>;

    /// Like [`Transport::send`], but gives up early once `cancel` fires.
    ///
    /// The default implementation only shortens the timeout when the token is already
    /// cancelled at call time.
    fn send_cancellable(
        &mut self,
        query: &Query,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, TransportError> {
        self.send(query, cancel.clamp(timeout))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, query: &Query, timeout: Duration) -> Result<AnalysisResult, TransportError> {
        (**self).send(query, timeout)
    }

    fn send_cancellable(
        &mut self,
        query: &Query,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, TransportError> {
        (**self).send_cancellable(query, timeout, cancel)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, query: &Query, timeout: Duration) -> Result<AnalysisResult, TransportError> {
        (**self).send(query, timeout)
    }

    fn send_cancellable(
        &mut self,
        query: &Query,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, TransportError> {
        (**self).send_cancellable(query, timeout, cancel)
    }
}

/// `timeout` from now. Timeouts too large to represent end a year from now.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    const FAR: Duration = Duration::from_secs(365 * 24 * 3600);
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR))
        .unwrap_or(now)
}

/// Creates transports on demand (one per scheduler worker).
pub trait TransportFactory: Send + Sync {
    /// A new, ready to use transport.
    fn create(&self) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_timeouts_do_not_overflow() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(3600));
        let near = deadline_after(Duration::from_millis(10));
        assert!(near <= Instant::now() + Duration::from_millis(10));
    }
}
