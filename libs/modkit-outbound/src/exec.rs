//! Execution core: turns a configured [`OutboundRequest`] into one classified,
//! instrumented exchange.

use crate::codec::{self, Decoded};
use crate::compliance::{self, REQUEST_ID, REQUEST_SOURCE};
use crate::context::RequestContext;
use crate::error::{BoxError, OutboundError};
use crate::instrument::{ExchangeSample, SegmentGuard};
use crate::request::OutboundRequest;
use crate::transport::TransportError;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::Span;

/// Exchange lifecycle, logged at trace level as it advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    HeadersApplied,
    PayloadEncoded,
    RequestBuilt,
    ComplianceChecked,
    Dispatched,
    ResponseRead,
    Classified,
    Done,
    Failed,
}

impl ExchangeState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HeadersApplied => "headers_applied",
            Self::PayloadEncoded => "payload_encoded",
            Self::RequestBuilt => "request_built",
            Self::ComplianceChecked => "compliance_checked",
            Self::Dispatched => "dispatched",
            Self::ResponseRead => "response_read",
            Self::Classified => "classified",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

fn transition(logger: &Span, state: ExchangeState) {
    tracing::trace!(parent: logger, state = state.as_str(), "outbound exchange state");
}

impl OutboundRequest {
    pub(crate) async fn execute<P>(
        &mut self,
        ctx: &RequestContext,
        method: Method,
        payload: Option<&P>,
    ) -> Result<StatusCode, OutboundError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.reset(method);
        let logger = self.settings.logger_span(ctx);
        let started = Instant::now();
        transition(&logger, ExchangeState::Idle);

        let result = match self.prepare(ctx, &logger, payload) {
            Ok(request) => self.dispatch(ctx, &logger, request).await,
            Err(err) => Err(err),
        };

        self.duration = started.elapsed();
        self.complete(&logger, result)
    }

    /// Report a failure detected before anything was prepared.
    pub(crate) fn fail_before_dispatch(
        &mut self,
        ctx: &RequestContext,
        err: OutboundError,
    ) -> Result<StatusCode, OutboundError> {
        self.reset(self.method.clone());
        let logger = self.settings.logger_span(ctx);
        self.complete(&logger, Err(err))
    }

    fn reset(&mut self, method: Method) {
        self.method = method;
        self.raw = Bytes::new();
        self.duration = std::time::Duration::ZERO;
        self.status = None;
        self.saturated_by = None;
        self.mismatch_raw = false;
        self.is_error = false;
        self.internal_error = false;
    }

    /// Steps that run before the network: headers, payload, request, compliance.
    fn prepare<P>(
        &mut self,
        ctx: &RequestContext,
        logger: &Span,
        payload: Option<&P>,
    ) -> Result<Request<Bytes>, OutboundError>
    where
        P: Serialize + ?Sized,
    {
        let context_headers = self.context_headers(ctx)?;
        transition(logger, ExchangeState::HeadersApplied);

        let body = match payload {
            Some(payload) => {
                let content_type = self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
                let body = codec::encode(payload, content_type)?;
                transition(logger, ExchangeState::PayloadEncoded);
                body
            }
            None => Bytes::new(),
        };

        let request = self.build_request(body, payload.is_some(), context_headers)?;
        transition(logger, ExchangeState::RequestBuilt);

        compliance::check(request.headers(), self.settings.strict_compliance)?;
        transition(logger, ExchangeState::ComplianceChecked);

        tracing::debug!(
            parent: logger,
            method = %self.method,
            host = self.endpoint.host().unwrap_or_default(),
            path = self.endpoint.path(),
            "launching outbound request"
        );
        Ok(request)
    }

    /// Request-scoped headers from the context providers; never stored on the instance.
    fn context_headers(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<(HeaderName, HeaderValue)>, OutboundError> {
        let mut headers = Vec::with_capacity(2);
        if let Some(provider) = &self.settings.request_id
            && let Some(id) = provider.request_id(ctx)
        {
            headers.push((REQUEST_ID, HeaderValue::try_from(id)?));
        }
        if let Some(provider) = &self.settings.request_source
            && let Some(source) = provider.request_source(ctx)
        {
            headers.push((REQUEST_SOURCE, HeaderValue::try_from(source)?));
        }
        Ok(headers)
    }

    fn build_request(
        &mut self,
        body: Bytes,
        has_payload: bool,
        context_headers: Vec<(HeaderName, HeaderValue)>,
    ) -> Result<Request<Bytes>, OutboundError> {
        if let Some(err) = self.header_error.take() {
            return Err(err);
        }

        let length = body.len();
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.endpoint.clone())
            .body(body)?;
        let headers = request.headers_mut();
        headers.clone_from(&self.headers);
        for (name, value) in context_headers {
            headers.insert(name, value);
        }
        if has_payload {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        Ok(request)
    }

    /// Network portion, run directly or as the breaker's unit of work.
    async fn dispatch(
        &mut self,
        ctx: &RequestContext,
        logger: &Span,
        request: Request<Bytes>,
    ) -> Result<StatusCode, OutboundError> {
        let Some(breaker) = self.breaker.clone() else {
            return self.exchange(ctx, logger, request).await;
        };

        let work = Box::pin(self.exchange(ctx, logger, request));
        let result = breaker.execute(work).await.map_err(OutboundError::from);
        if let Err(OutboundError::BreakerRejected(_)) = &result {
            tracing::debug!(parent: logger, "circuit breaker rejected outbound request");
        }
        result
    }

    async fn exchange(
        &mut self,
        ctx: &RequestContext,
        logger: &Span,
        mut request: Request<Bytes>,
    ) -> Result<StatusCode, OutboundError> {
        let transport = self
            .transport
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.settings.transport));

        let span = self.settings.tracer.start_span(ctx, logger, &mut request);
        let transaction = self
            .settings
            .apm
            .as_ref()
            .and_then(|provider| provider.transaction(ctx));
        let mut segment =
            SegmentGuard::start(transaction, self.apm_segment_name.as_deref(), &request);
        transition(logger, ExchangeState::Dispatched);

        let sent = tokio::select! {
            biased;
            () = ctx.cancellation_token().cancelled() => Err(TransportError::Cancelled),
            sent = transport.send(request) => sent,
        };
        span.finish(sent.as_ref().map(Response::status));
        let response = sent?;

        let status = response.status();
        segment.record_status(status);
        drop(segment);

        self.status = Some(status);
        self.is_error = !status.is_success();

        let (parts, body) = response.into_parts();
        let collected = tokio::select! {
            biased;
            () = ctx.cancellation_token().cancelled() => {
                Err(Box::new(TransportError::Cancelled) as BoxError)
            }
            collected = body.collect() => collected,
        };
        let body = collected
            .map_err(|source| OutboundError::Read { status, source })?
            .to_bytes();
        transition(logger, ExchangeState::ResponseRead);

        if self.keep_raw {
            self.raw = body.clone();
        }

        let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        match codec::decode(&body, content_type, status, &self.targets)? {
            Decoded::Saturated(slot) => self.saturated_by = Some(slot),
            Decoded::Skipped => {}
            Decoded::Mismatch => {
                tracing::info!(
                    parent: logger,
                    status = status.as_u16(),
                    content_type = content_type.unwrap_or_default(),
                    "response is not JSON; raw body retained"
                );
                self.mismatch_raw = true;
                self.raw = body;
                transition(logger, ExchangeState::Classified);
                return Ok(StatusCode::UNPROCESSABLE_ENTITY);
            }
        }
        transition(logger, ExchangeState::Classified);

        Ok(status)
    }

    /// Log failures, flag errors and emit metrics exactly once.
    fn complete(
        &mut self,
        logger: &Span,
        result: Result<StatusCode, OutboundError>,
    ) -> Result<StatusCode, OutboundError> {
        if let Err(err) = &result {
            self.internal_error = err.is_pre_dispatch();
            if self.status.is_none() {
                self.is_error = true;
            }
            transition(logger, ExchangeState::Failed);
            self.log_failure(logger, err);
        } else {
            transition(logger, ExchangeState::Done);
        }

        if !self.internal_error {
            self.record_metrics(logger, &result);
        }
        result
    }

    fn log_failure(&self, logger: &Span, err: &OutboundError) {
        let host = self.endpoint.host().unwrap_or_default();
        if err.is_timeout() {
            tracing::error!(
                parent: logger,
                error_kind = err.kind(),
                error = %err,
                method = %self.method,
                host,
                "outbound request timed out"
            );
        } else {
            tracing::error!(
                parent: logger,
                error_kind = err.kind(),
                error = %err,
                method = %self.method,
                host,
                "outbound request failed"
            );
        }
    }

    fn record_metrics(&self, logger: &Span, result: &Result<StatusCode, OutboundError>) {
        let Some(statsd) = &self.statsd else {
            return;
        };

        let status = self.status.unwrap_or_else(|| match result {
            Ok(status) => *status,
            Err(err) => err.status_code(),
        });
        let outcome_tag = if status.is_success() {
            &self.settings.success_tag
        } else {
            &self.settings.failure_tag
        };

        statsd.record(
            &ExchangeSample {
                status,
                method: &self.method,
                elapsed: self.duration,
                outcome_tag,
            },
            self.settings.statsd_rate,
            logger,
        );
    }
}
