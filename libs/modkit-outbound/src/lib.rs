#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Outbound HTTP request client for `ModKit` services
//!
//! Every call made through [`OutboundRequest`] follows the same conventions:
//! - `Request-ID`, `Request-Source` and `Calling-Service` tracing headers,
//!   enforced before dispatch when strict compliance is on
//! - JSON content negotiation by default, raw bytes for other content types
//! - Response decoding into typed [`Saturation`] handles chosen by status code
//! - Optional circuit breaker around the network portion of the exchange
//! - One statsd counter and timing per exchange, a tracing span and an APM
//!   segment around the network call
//!
//! # Example
//!
//! ```ignore
//! use modkit_outbound::{OutboundDefaults, OutboundRequest, RequestContext, set_defaults};
//!
//! set_defaults(OutboundDefaults {
//!     service_name: Some("pets".to_owned()),
//!     strict_compliance: true,
//!     ..OutboundDefaults::default()
//! })?;
//!
//! let mut request = OutboundRequest::new("https://api.example.com/cats")?;
//! let cats = request.will_saturate::<Vec<Cat>>();
//! let status = request.get(&ctx).await?;
//! ```
//!
//! # Status codes
//!
//! Verbs return the received status on success. On failure the error carries
//! a status through [`OutboundError::status_code`]: `500` for failures before
//! or during dispatch, `424` when the circuit breaker refused the call, and the
//! received status for body read or decode failures. A response that is not
//! JSON while a decode target was registered returns `422` without an error and
//! keeps the raw body available through [`OutboundRequest::raw_response`].

mod breaker;
mod codec;
mod compliance;
mod config;
mod context;
mod error;
mod exec;
mod instrument;
pub mod otel;
mod request;
mod saturate;
mod transport;

pub use breaker::{BreakerError, BreakerWork, CircuitBreaker, PassThrough};
pub use codec::{JSON_CONTENT_TYPE, is_json_content_type};
pub use compliance::{CALLING_SERVICE, ComplianceFlags, REQUEST_ID, REQUEST_SOURCE};
pub use config::{
    DEFAULT_FAILURE_TAG, DEFAULT_SUCCESS_TAG, HOSTNAME_ENV, OutboundDefaults, SERVICE_NAME_ENV,
    Settings, TransportConfig, TransportSecurity, current_defaults, set_defaults,
};
pub use context::{
    FromExtensions, LoggerProvider, RequestContext, RequestId, RequestIdProvider, RequestSource,
    RequestSourceProvider,
};
pub use error::{BoxError, OutboundError};
pub use instrument::{
    ApmProvider, ApmSegment, ApmTransaction, ExchangeSpan, StatsdClient, Tracer, TracingTracer,
    span_name,
};
pub use request::OutboundRequest;
pub use saturate::{DecodeTarget, DecodeTargets, Saturation, TargetSlot};
pub use transport::{
    BodyTimeout, BodyTooLarge, ConnectTimeout, HyperTransport, ResponseBody, Transport,
    TransportError,
};
