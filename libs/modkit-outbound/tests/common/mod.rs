#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use modkit_outbound::{
    BoxError, BreakerError, BreakerWork, CircuitBreaker, OutboundDefaults, ResponseBody, Settings,
    StatsdClient, Transport, TransportConfig, TransportError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pet {
    pub name: String,
    pub color: String,
}

pub fn scruffy() -> Pet {
    Pet {
        name: "Scruffy".to_owned(),
        color: "Orange".to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PetStore {
    pub cats: Vec<Pet>,
    pub dogs: Vec<Pet>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Problem {
    pub message: String,
}

/// What a [`StubTransport`] received.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: http::Method,
    pub uri: http::Uri,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// Transport returning a canned response and counting invocations.
pub struct StubTransport {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: Bytes,
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

impl StubTransport {
    pub fn new(status: u16, content_type: Option<&'static str>, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status: StatusCode::from_u16(status).unwrap(),
            content_type,
            body: Bytes::from_static(body.as_bytes()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn json(status: u16, body: &'static str) -> Arc<Self> {
        Self::new(status, Some("application/json"), body)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = request.into_parts();
        self.seen.lock().push(SeenRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        });

        let mut builder = Response::builder().status(self.status);
        if let Some(content_type) = self.content_type {
            builder = builder.header(http::header::CONTENT_TYPE, content_type);
        }
        let body = Full::new(self.body.clone())
            .map_err(|never| -> BoxError { match never {} })
            .boxed();
        Ok(builder.body(body).unwrap())
    }
}

/// Statsd delegate recording every sample.
#[derive(Default)]
pub struct RecordingStatsd {
    pub counters: Mutex<Vec<(String, Vec<String>, f64)>>,
    pub timings: Mutex<Vec<(String, Duration, Vec<String>)>>,
}

impl StatsdClient for RecordingStatsd {
    fn incr(&self, name: &str, tags: &[String], rate: f64) -> Result<(), BoxError> {
        self.counters.lock().push((name.to_owned(), tags.to_vec(), rate));
        Ok(())
    }

    fn timing(
        &self,
        name: &str,
        value: Duration,
        tags: &[String],
        _rate: f64,
    ) -> Result<(), BoxError> {
        self.timings.lock().push((name.to_owned(), value, tags.to_vec()));
        Ok(())
    }
}

/// Breaker that refuses every call.
#[derive(Default)]
pub struct RejectingBreaker {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CircuitBreaker for RejectingBreaker {
    async fn execute(&self, _work: BreakerWork<'_>) -> Result<StatusCode, BreakerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BreakerError::Rejected("circuit open".into()))
    }
}

/// Breaker that runs the work and counts outcomes.
#[derive(Default)]
pub struct CountingBreaker {
    pub successes: AtomicUsize,
    pub failures: AtomicUsize,
}

#[async_trait]
impl CircuitBreaker for CountingBreaker {
    async fn execute(&self, work: BreakerWork<'_>) -> Result<StatusCode, BreakerError> {
        match work.await {
            Ok(status) => {
                self.successes.fetch_add(1, Ordering::SeqCst);
                Ok(status)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// Defaults for tests: fixed service name, plain HTTP allowed.
pub fn defaults() -> OutboundDefaults {
    OutboundDefaults {
        service_name: Some("unit-test".to_owned()),
        user_agent: Some("unit-test".to_owned()),
        transport_config: TransportConfig::for_testing(),
        ..OutboundDefaults::default()
    }
}

pub fn settings_with(transport: Arc<dyn Transport>) -> Arc<Settings> {
    Arc::new(
        OutboundDefaults {
            transport: Some(transport),
            ..defaults()
        }
        .resolve()
        .unwrap(),
    )
}
