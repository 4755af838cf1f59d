//! Circuit breaker seam.
//!
//! The breaker algorithm lives outside this crate. The execution core hands it
//! the network portion of an exchange (dispatch, read, decode) as a boxed
//! future and interprets the outcome.

use crate::error::{BoxError, OutboundError};
use async_trait::async_trait;
use http::StatusCode;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Unit of work run under a breaker.
pub type BreakerWork<'a> =
    Pin<Box<dyn Future<Output = Result<StatusCode, OutboundError>> + Send + 'a>>;

/// Outcome of a breaker call that did not produce a status.
#[derive(Error, Debug)]
pub enum BreakerError {
    /// The work ran and failed; its error is passed through.
    #[error(transparent)]
    Inner(OutboundError),

    /// The breaker refused to run the work (open circuit, bulkhead full, ...).
    #[error("circuit breaker rejected the call: {0}")]
    Rejected(#[source] BoxError),
}

impl From<BreakerError> for OutboundError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::Inner(inner) => inner,
            BreakerError::Rejected(source) => OutboundError::BreakerRejected(source),
        }
    }
}

/// Resiliency wrapper around a single exchange.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Run `work`, or refuse to.
    ///
    /// # Errors
    /// `BreakerError::Inner` with the work's own failure, or
    /// `BreakerError::Rejected` when the work was not run.
    async fn execute(&self, work: BreakerWork<'_>) -> Result<StatusCode, BreakerError>;
}

/// Breaker that always runs the work.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

#[async_trait]
impl CircuitBreaker for PassThrough {
    async fn execute(&self, work: BreakerWork<'_>) -> Result<StatusCode, BreakerError> {
        work.await.map_err(BreakerError::Inner)
    }
}
