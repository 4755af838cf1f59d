//! Mandated request-tracing headers and the gate that checks them.

use crate::error::OutboundError;
use http::HeaderMap;
use http::header::HeaderName;

/// Request-tracing id propagated across services
pub const REQUEST_ID: HeaderName = HeaderName::from_static("request-id");

/// Originating request source (e.g. the public entry point)
pub const REQUEST_SOURCE: HeaderName = HeaderName::from_static("request-source");

/// Name of the service making the call
pub const CALLING_SERVICE: HeaderName = HeaderName::from_static("calling-service");

/// Presence of each mandated tracing header in an outgoing header map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComplianceFlags {
    pub request_id: bool,
    pub request_source: bool,
    pub calling_service: bool,
}

impl ComplianceFlags {
    /// Derive flags from `headers`. A header counts only with a non-blank value.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            request_id: has_value(headers, &REQUEST_ID),
            request_source: has_value(headers, &REQUEST_SOURCE),
            calling_service: has_value(headers, &CALLING_SERVICE),
        }
    }

    #[must_use]
    pub fn is_compliant(&self) -> bool {
        self.request_id && self.request_source && self.calling_service
    }

    /// Canonical names of the headers that are missing.
    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.request_id, "Request-ID"),
            (self.request_source, "Request-Source"),
            (self.calling_service, "Calling-Service"),
        ]
        .into_iter()
        .filter_map(|(present, name)| (!present).then_some(name))
        .collect()
    }
}

fn has_value(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers
        .get(name)
        .is_some_and(|value| !value.as_bytes().trim_ascii().is_empty())
}

/// Enforce the header requirements when `strict` is on.
///
/// # Errors
/// Returns [`OutboundError::Compliance`] listing the missing headers.
pub fn check(headers: &HeaderMap, strict: bool) -> Result<ComplianceFlags, OutboundError> {
    let flags = ComplianceFlags::from_headers(headers);
    if strict && !flags.is_compliant() {
        return Err(OutboundError::Compliance {
            missing: flags.missing(),
        });
    }
    Ok(flags)
}
