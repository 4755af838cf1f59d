//! Instrumentation around a single exchange: statsd counters and timings,
//! a tracing span over the network call and an optional APM segment.

use crate::context::RequestContext;
use crate::error::BoxError;
use crate::transport::TransportError;
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Metrics delegate. Calls are fire-and-forget; errors are logged and dropped.
pub trait StatsdClient: Send + Sync {
    /// Increment counter `name` by one.
    ///
    /// # Errors
    /// Returns an error if the backend rejected the sample.
    fn incr(&self, name: &str, tags: &[String], rate: f64) -> Result<(), BoxError>;

    /// Record `value` as a timing sample for `name`.
    ///
    /// # Errors
    /// Returns an error if the backend rejected the sample.
    fn timing(&self, name: &str, value: Duration, tags: &[String], rate: f64)
    -> Result<(), BoxError>;
}

/// Statsd delegate plus the stat name and base tags configured on a request.
#[derive(Clone)]
pub struct StatsdHandle {
    pub(crate) client: Arc<dyn StatsdClient>,
    pub(crate) stat: String,
    pub(crate) tags: Vec<String>,
}

impl StatsdHandle {
    pub(crate) fn new(client: Arc<dyn StatsdClient>, stat: String, tags: Vec<String>) -> Self {
        Self { client, stat, tags }
    }

    /// Emit one counter and one timing sample for a completed exchange.
    pub(crate) fn record(&self, sample: &ExchangeSample<'_>, rate: f64, logger: &Span) {
        let tags = exchange_tags(&self.tags, sample);

        if let Err(e) = self.client.incr(&self.stat, &tags, rate) {
            tracing::warn!(
                parent: logger,
                stat = %self.stat,
                error = %e,
                "statsd increment failed"
            );
        }
        if let Err(e) = self.client.timing(&self.stat, sample.elapsed, &tags, rate) {
            tracing::warn!(parent: logger, stat = %self.stat, error = %e, "statsd timing failed");
        }
    }
}

impl std::fmt::Debug for StatsdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsdHandle")
            .field("stat", &self.stat)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// What a completed exchange reports to the metrics delegate.
pub struct ExchangeSample<'a> {
    pub status: StatusCode,
    pub method: &'a Method,
    pub elapsed: Duration,
    pub outcome_tag: &'a str,
}

/// Base tags plus `response-code`, `response-type`, `http-verb` and the outcome tag.
#[must_use]
pub fn exchange_tags(base: &[String], sample: &ExchangeSample<'_>) -> Vec<String> {
    let code = sample.status.as_u16();
    let mut tags = Vec::with_capacity(base.len() + 4);
    tags.extend_from_slice(base);
    tags.push(format!("response-code:{code}"));
    tags.push(format!("response-type:{}xx", code / 100));
    tags.push(format!("http-verb:{}", sample.method));
    tags.push(sample.outcome_tag.to_owned());
    tags
}

/// APM transaction lookup.
pub trait ApmProvider: Send + Sync {
    fn transaction(&self, ctx: &RequestContext) -> Option<Arc<dyn ApmTransaction>>;
}

impl<F> ApmProvider for F
where
    F: Fn(&RequestContext) -> Option<Arc<dyn ApmTransaction>> + Send + Sync,
{
    fn transaction(&self, ctx: &RequestContext) -> Option<Arc<dyn ApmTransaction>> {
        self(ctx)
    }
}

/// An in-flight APM transaction able to open external segments.
pub trait ApmTransaction: Send + Sync {
    /// Open an external segment for the outgoing request.
    ///
    /// `name` is the per-request segment name override, if one was set.
    fn start_external_segment(
        &self,
        name: Option<&str>,
        request: &Request<Bytes>,
    ) -> Box<dyn ApmSegment>;
}

/// An open external segment.
pub trait ApmSegment: Send {
    /// Attach the response status before the segment ends.
    fn record_status(&mut self, _status: StatusCode) {}

    /// Close the segment.
    fn end(self: Box<Self>);
}

/// Ends the wrapped segment exactly once, when dropped.
pub struct SegmentGuard(Option<Box<dyn ApmSegment>>);

impl SegmentGuard {
    pub(crate) fn start(
        transaction: Option<Arc<dyn ApmTransaction>>,
        name: Option<&str>,
        request: &Request<Bytes>,
    ) -> Self {
        Self(transaction.map(|txn| txn.start_external_segment(name, request)))
    }

    pub(crate) fn record_status(&mut self, status: StatusCode) {
        if let Some(segment) = self.0.as_mut() {
            segment.record_status(status);
        }
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        if let Some(segment) = self.0.take() {
            segment.end();
        }
    }
}

/// Span wrapper around the network call.
pub trait Tracer: Send + Sync {
    /// Open a span for `request`. Implementations may add propagation headers.
    fn start_span(
        &self,
        ctx: &RequestContext,
        parent: &Span,
        request: &mut Request<Bytes>,
    ) -> Box<dyn ExchangeSpan>;
}

/// A span opened by a [`Tracer`].
pub trait ExchangeSpan: Send {
    /// Close the span with the transport outcome.
    fn finish(self: Box<Self>, outcome: Result<StatusCode, &TransportError>);
}

/// Default tracer: a `tracing` span per exchange, with W3C header injection
/// under the `otel` feature.
///
/// The span is `outgoing_http` with fields:
/// - `otel.name`: `"{METHOD} {host}"`
/// - `otel.kind`: "client"
/// - `http.method`, `server.address`
///
/// Records `http.status_code` on completion and sets `error=true` for
/// 4xx/5xx and transport failures.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(
        &self,
        _ctx: &RequestContext,
        parent: &Span,
        request: &mut Request<Bytes>,
    ) -> Box<dyn ExchangeSpan> {
        let name = span_name(request.method(), request.uri());
        let span = tracing::info_span!(
            parent: parent,
            "outgoing_http",
            otel.name = %name,
            otel.kind = "client",
            http.method = %request.method(),
            server.address = request.uri().host().unwrap_or_default(),
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        crate::otel::inject_span(&span, request.headers_mut());

        Box::new(TracingSpan { span })
    }
}

struct TracingSpan {
    span: Span,
}

impl ExchangeSpan for TracingSpan {
    fn finish(self: Box<Self>, outcome: Result<StatusCode, &TransportError>) {
        match outcome {
            Ok(status) => {
                self.span.record("http.status_code", status.as_u16());
                if status.is_client_error() || status.is_server_error() {
                    self.span.record("error", true);
                }
            }
            Err(_) => {
                self.span.record("error", true);
            }
        }
    }
}

/// `"{METHOD} {host}"`; path and query never appear in the name.
#[must_use]
pub fn span_name(method: &Method, uri: &Uri) -> String {
    format!("{method} {}", uri.host().unwrap_or_default())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingStatsd {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl StatsdClient for RecordingStatsd {
        fn incr(&self, name: &str, tags: &[String], _rate: f64) -> Result<(), BoxError> {
            self.calls.lock().push((format!("incr:{name}"), tags.to_vec()));
            if self.fail {
                return Err("statsd down".into());
            }
            Ok(())
        }

        fn timing(
            &self,
            name: &str,
            _value: Duration,
            tags: &[String],
            _rate: f64,
        ) -> Result<(), BoxError> {
            self.calls.lock().push((format!("timing:{name}"), tags.to_vec()));
            if self.fail {
                return Err("statsd down".into());
            }
            Ok(())
        }
    }

    struct CountingSegment {
        ended: Arc<AtomicUsize>,
        status: Arc<Mutex<Option<StatusCode>>>,
    }

    impl ApmSegment for CountingSegment {
        fn record_status(&mut self, status: StatusCode) {
            *self.status.lock() = Some(status);
        }

        fn end(self: Box<Self>) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingTransaction {
        ended: Arc<AtomicUsize>,
        status: Arc<Mutex<Option<StatusCode>>>,
        names: Mutex<Vec<Option<String>>>,
    }

    impl ApmTransaction for CountingTransaction {
        fn start_external_segment(
            &self,
            name: Option<&str>,
            _request: &Request<Bytes>,
        ) -> Box<dyn ApmSegment> {
            self.names.lock().push(name.map(ToOwned::to_owned));
            Box::new(CountingSegment {
                ended: Arc::clone(&self.ended),
                status: Arc::clone(&self.status),
            })
        }
    }

    fn sample(status: StatusCode, method: &Method) -> ExchangeSample<'_> {
        ExchangeSample {
            status,
            method,
            elapsed: Duration::from_millis(12),
            outcome_tag: "processed:success",
        }
    }

    #[test]
    fn test_exchange_tags() {
        let base = vec!["team:pets".to_owned()];
        let tags = exchange_tags(&base, &sample(StatusCode::OK, &Method::GET));
        assert_eq!(
            tags,
            vec![
                "team:pets",
                "response-code:200",
                "response-type:2xx",
                "http-verb:GET",
                "processed:success",
            ]
        );
    }

    #[test]
    fn test_record_emits_counter_and_timing() {
        let client = Arc::new(RecordingStatsd::default());
        let handle = StatsdHandle::new(client.clone(), "pets.get".to_owned(), Vec::new());

        handle.record(&sample(StatusCode::NOT_FOUND, &Method::POST), 1.0, &Span::none());

        let calls = client.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "incr:pets.get");
        assert_eq!(calls[1].0, "timing:pets.get");
        assert!(calls[0].1.contains(&"response-type:4xx".to_owned()));
        assert!(calls[0].1.contains(&"http-verb:POST".to_owned()));
    }

    #[test]
    fn test_record_swallows_delegate_errors() {
        let client = Arc::new(RecordingStatsd {
            fail: true,
            ..RecordingStatsd::default()
        });
        let handle = StatsdHandle::new(client.clone(), "pets.get".to_owned(), Vec::new());

        handle.record(&sample(StatusCode::OK, &Method::GET), 0.5, &Span::none());

        assert_eq!(client.calls.lock().len(), 2);
    }

    #[test]
    fn test_segment_guard_ends_once() {
        let ended = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(Mutex::new(None));
        let txn = Arc::new(CountingTransaction {
            ended: Arc::clone(&ended),
            status: Arc::clone(&status),
            names: Mutex::new(Vec::new()),
        });
        let request = Request::new(Bytes::new());

        {
            let mut guard = SegmentGuard::start(Some(txn.clone()), Some("pets"), &request);
            guard.record_status(StatusCode::CREATED);
        }

        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(*status.lock(), Some(StatusCode::CREATED));
        assert_eq!(*txn.names.lock(), vec![Some("pets".to_owned())]);
    }

    #[test]
    fn test_segment_guard_without_transaction() {
        let request = Request::new(Bytes::new());
        let mut guard = SegmentGuard::start(None, None, &request);
        guard.record_status(StatusCode::OK);
        drop(guard);
    }

    #[test]
    fn test_span_name_omits_path_and_query() {
        let uri: Uri = "https://pets.example.com:8443/cats/1?token=secret".parse().unwrap();
        assert_eq!(span_name(&Method::DELETE, &uri), "DELETE pets.example.com");
    }

    #[test]
    fn test_tracing_tracer_finishes() {
        let mut request = Request::builder()
            .uri("https://pets.example.com/cats")
            .body(Bytes::new())
            .unwrap();
        let span = TracingTracer.start_span(&RequestContext::new(), &Span::none(), &mut request);
        span.finish(Ok(StatusCode::OK));

        let span = TracingTracer.start_span(&RequestContext::new(), &Span::none(), &mut request);
        span.finish(Err(&TransportError::Cancelled));
    }
}
