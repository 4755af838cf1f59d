//! W3C trace-context propagation for outgoing requests.
//!
//! - With `otel` feature: the global text-map propagator injects the span's context
//! - Without `otel` feature: no-op

#[cfg(feature = "otel")]
mod imp {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use opentelemetry::global;
    use opentelemetry::propagation::Injector;
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    struct HeadersInjector<'a>(&'a mut HeaderMap);

    impl Injector for HeadersInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let Ok(name) = HeaderName::from_bytes(key.as_bytes())
                && let Ok(val) = HeaderValue::from_str(&value)
            {
                self.0.insert(name, val);
            }
        }
    }

    /// Inject `span`'s OpenTelemetry context into `headers`.
    pub fn inject_span(span: &Span, headers: &mut HeaderMap) {
        let cx = span.context();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut HeadersInjector(headers));
        });
    }
}

#[cfg(not(feature = "otel"))]
mod imp {
    use http::HeaderMap;
    use tracing::Span;

    /// No-op: OpenTelemetry is disabled
    pub fn inject_span(_span: &Span, _headers: &mut HeaderMap) {}
}

pub use imp::inject_span;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    #[cfg(not(feature = "otel"))]
    fn test_inject_span_noop() {
        let mut headers = HeaderMap::new();
        let span = tracing::info_span!("test");
        inject_span(&span, &mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    #[cfg(feature = "otel")]
    fn test_inject_span_no_panic() {
        let mut headers = HeaderMap::new();
        let span = tracing::info_span!("test");
        // Without an installed subscriber layer nothing is injected, but it must not panic
        inject_span(&span, &mut headers);
    }
}
