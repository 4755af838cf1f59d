//! Transport collaborator.
//!
//! The execution core only needs a synchronous-looking `send(request) -> response`
//! contract. [`HyperTransport`] is the default implementation: a pooled
//! hyper-util client over rustls with independent connect, TLS handshake,
//! idle and overall request timeouts.

use crate::config::{TransportConfig, TransportSecurity};
use crate::error::BoxError;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body::Frame;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Sleep};

/// Boxed response body handed back by a [`Transport`].
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Errors a transport reports when no response could be obtained.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The exchange did not complete within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's context was cancelled while the request was in flight
    #[error("Request cancelled by caller context")]
    Cancelled,

    /// A connection could not be established
    #[error("Connection failed: {0}")]
    Connect(#[source] BoxError),

    /// Any other network failure
    #[error("Transport error: {0}")]
    Other(#[source] BoxError),
}

impl TransportError {
    /// Whether this error represents a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connect(source) | Self::Other(source) => chain_has_timeout(source.as_ref()),
            Self::Cancelled => false,
        }
    }
}

/// Walk an error chain looking for a timeout marker.
fn chain_has_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<ConnectTimeout>() || e.is::<BodyTimeout>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::TimedOut
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// Body read exceeded the overall request deadline.
#[derive(Error, Debug, Clone, Copy)]
#[error("response body not received within {0:?}")]
pub struct BodyTimeout(pub Duration);

/// Body exceeded the configured size limit.
#[derive(Error, Debug, Clone, Copy)]
#[error("response body too large: limit {limit} bytes, got {actual} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
    pub actual: usize,
}

/// Connection setup (TCP connect plus TLS handshake) exceeded its budget.
#[derive(Error, Debug, Clone, Copy)]
#[error("connection not established within {0:?}")]
pub struct ConnectTimeout(pub Duration);

/// Synchronous request/response contract over method, URL, headers and body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one exchange. Must not retry.
    ///
    /// # Errors
    /// Returns [`TransportError`] when no response head was received.
    async fn send(&self, request: Request<Bytes>) -> Result<Response<ResponseBody>, TransportError>;
}

type HttpsClient = Client<ConnectDeadline<HttpsConnector<HttpConnector>>, Full<Bytes>>;

/// Default transport backed by the hyper-util pooled client.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpsClient,
    request_timeout: Duration,
    max_body_size: usize,
}

impl HyperTransport {
    /// Build a transport from the given timeout and pool settings.
    ///
    /// # Errors
    /// Returns `TransportError::Other` if TLS initialization fails.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                target: "modkit_outbound::security",
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout));
        http.set_keepalive(config.tcp_keepalive);

        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        let builder = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(provider)
            .map_err(|e| TransportError::Other(Box::new(e)))?;
        let https = match config.security {
            TransportSecurity::AllowInsecureHttp => {
                builder.https_or_http().enable_all_versions().wrap_connector(http)
            }
            TransportSecurity::TlsOnly => {
                builder.https_only().enable_all_versions().wrap_connector(http)
            }
        };

        // TCP connect has its own timeout on the HttpConnector; the TLS
        // handshake gets the remainder of connect + handshake budget.
        let connector = ConnectDeadline {
            inner: https,
            budget: config.connect_timeout + config.tls_handshake_timeout,
        };

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_timer is required for pool_idle_timeout to take effect
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host);

        Ok(Self {
            client: client_builder.build(connector),
            request_timeout: config.request_timeout,
            max_body_size: config.max_body_size,
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let deadline = Instant::now() + self.request_timeout;
        let request = request.map(Full::new);

        let response = tokio::time::timeout_at(deadline, self.client.request(request))
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))?
            .map_err(map_client_error)?;

        let (parts, body) = response.into_parts();
        let body = BoundedBody::new(body, self.max_body_size, deadline, self.request_timeout);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Connect-phase timeouts stay `Connect`; `is_timeout` finds them in the chain.
fn map_client_error(err: hyper_util::client::legacy::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect(Box::new(err))
    } else {
        TransportError::Other(Box::new(err))
    }
}

/// Connector wrapper bounding TCP connect plus TLS handshake.
#[derive(Clone)]
struct ConnectDeadline<C> {
    inner: C,
    budget: Duration,
}

impl<C> tower::Service<Uri> for ConnectDeadline<C>
where
    C: tower::Service<Uri>,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connecting = self.inner.call(uri);
        let budget = self.budget;
        Box::pin(async move {
            match tokio::time::timeout(budget, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(ConnectTimeout(budget)) as BoxError),
            }
        })
    }
}

pin_project! {
    /// Body wrapper enforcing the size limit and the overall request deadline
    /// while the execution core reads the response.
    pub struct BoundedBody<B> {
        #[pin]
        inner: B,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
        limit: usize,
        read: usize,
    }
}

impl<B> BoundedBody<B> {
    /// Wrap `inner`, failing once `limit` bytes are exceeded or `deadline` passes.
    pub fn new(inner: B, limit: usize, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep_until(deadline),
            timeout,
            limit,
            read: 0,
        }
    }
}

impl<B> http_body::Body for BoundedBody<B>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        if this.deadline.poll(cx).is_ready() {
            return Poll::Ready(Some(Err(Box::new(BodyTimeout(*this.timeout)))));
        }

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(Box::new(BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        }))));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}
