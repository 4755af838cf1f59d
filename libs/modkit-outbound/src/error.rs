use http::StatusCode;
use thiserror::Error;

/// Boxed error used at collaborator boundaries (transport, breaker, metrics).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outbound request error types
///
/// Every variant maps to a status code through [`OutboundError::status_code`],
/// so callers always receive a status alongside the error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OutboundError {
    /// Endpoint missing or invalid, or defaults could not be resolved
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// One or more mandated tracing headers are missing (strict mode only)
    #[error("request tracing header requirements check failed: missing {}", .missing.join(", "))]
    Compliance {
        /// Names of the headers that were absent or blank
        missing: Vec<&'static str>,
    },

    /// JSON serialization of the outgoing payload failed
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload is not a byte sequence or string while a non-JSON content type is set
    #[error("the payload cannot be converted to a byte slice (content type '{content_type}')")]
    UnsupportedPayload {
        /// The content type that was in effect
        content_type: String,
    },

    /// The transport request could not be constructed (method, URL or header)
    #[error("Failed to build request: {0}")]
    RequestConstruction(#[source] BoxError),

    /// Network failure, timeout or cancellation before a response arrived
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    /// The response body could not be read
    #[error("Failed to read response body (HTTP {status}): {source}")]
    Read {
        status: StatusCode,
        #[source]
        source: BoxError,
    },

    /// The response body could not be decoded into the expected target
    #[error("Failed to decode response body (HTTP {status}): {source}")]
    Decode {
        status: StatusCode,
        #[source]
        source: serde_json::Error,
    },

    /// The circuit breaker refused to run the exchange
    #[error("Circuit breaker rejected the request: {0}")]
    BreakerRejected(#[source] BoxError),
}

impl OutboundError {
    /// Status code reported to the caller together with this error.
    ///
    /// Failures before dispatch and transport failures carry no real status and
    /// map to `500`; breaker rejection maps to `424 Failed Dependency`; read and
    /// decode failures keep the status that was actually received.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Read { status, .. } | Self::Decode { status, .. } => *status,
            Self::BreakerRejected(_) => StatusCode::FAILED_DEPENDENCY,
            Self::Config(_)
            | Self::Compliance { .. }
            | Self::Encode(_)
            | Self::UnsupportedPayload { .. }
            | Self::RequestConstruction(_)
            | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable tag used as the `error_kind` log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Compliance { .. } => "compliance",
            Self::Encode(_) => "encode",
            Self::UnsupportedPayload { .. } => "unsupported_payload",
            Self::RequestConstruction(_) => "request_construction",
            Self::Transport(_) => "transport",
            Self::Read { .. } => "read",
            Self::Decode { .. } => "decode",
            Self::BreakerRejected(_) => "breaker_rejected",
        }
    }

    /// Whether the failure was caused by a timeout (transport or body read).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout(),
            Self::Read { source, .. } => source.is::<crate::transport::BodyTimeout>(),
            _ => false,
        }
    }

    /// Whether the failure happened before anything was sent.
    #[must_use]
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Compliance { .. }
                | Self::Encode(_)
                | Self::UnsupportedPayload { .. }
                | Self::RequestConstruction(_)
        )
    }
}

impl From<http::Error> for OutboundError {
    fn from(err: http::Error) -> Self {
        OutboundError::RequestConstruction(Box::new(err))
    }
}

impl From<http::header::InvalidHeaderName> for OutboundError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        OutboundError::RequestConstruction(Box::new(err))
    }
}

impl From<http::header::InvalidHeaderValue> for OutboundError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        OutboundError::RequestConstruction(Box::new(err))
    }
}
