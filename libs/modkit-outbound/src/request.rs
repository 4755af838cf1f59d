use crate::breaker::CircuitBreaker;
use crate::codec::{JSON_CONTENT_TYPE, is_json_content_type};
use crate::compliance::CALLING_SERVICE;
use crate::config::{Settings, current_defaults};
use crate::context::RequestContext;
use crate::error::OutboundError;
use crate::instrument::{StatsdClient, StatsdHandle};
use crate::saturate::{DecodeTargets, Saturation, TargetSlot};
use crate::transport::Transport;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// One outbound call: endpoint, headers, decode targets and instrumentation
/// settings, plus the outcome of the last exchange.
///
/// Setters mutate only this instance. Verbs take `&mut self`, so one instance
/// runs one exchange at a time; create one per concurrent call.
///
/// # Example
///
/// ```ignore
/// use modkit_outbound::{OutboundRequest, RequestContext};
///
/// let mut request = OutboundRequest::new("https://pets.example.com/cats")?;
/// let cats = request.will_saturate::<Vec<Cat>>();
/// let problem = request.will_saturate_on_error::<Problem>();
///
/// let status = request.get(&ctx).await?;
/// if request.status_code_is_error() {
///     tracing::warn!(?status, problem = ?problem.take(), "lookup failed");
/// } else {
///     let cats = cats.take().unwrap_or_default();
/// }
/// ```
pub struct OutboundRequest {
    pub(crate) settings: Arc<Settings>,
    pub(crate) endpoint: Uri,
    pub(crate) method: Method,
    pub(crate) headers: HeaderMap,
    /// Invalid header captured by a setter (deferred to the next verb)
    pub(crate) header_error: Option<OutboundError>,
    pub(crate) breaker: Option<Arc<dyn CircuitBreaker>>,
    pub(crate) statsd: Option<StatsdHandle>,
    pub(crate) targets: DecodeTargets,
    pub(crate) apm_segment_name: Option<String>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) keep_raw: bool,
    pub(crate) raw: Bytes,
    /// Raw body kept for the last exchange only (non-JSON response)
    pub(crate) mismatch_raw: bool,
    pub(crate) duration: Duration,
    pub(crate) status: Option<StatusCode>,
    pub(crate) saturated_by: Option<TargetSlot>,
    pub(crate) is_error: bool,
    /// Failure before any network attempt; suppresses metrics
    pub(crate) internal_error: bool,
}

impl OutboundRequest {
    /// Request against `endpoint` using the process-wide defaults.
    ///
    /// # Errors
    /// Returns [`OutboundError::Config`] if `endpoint` is not an absolute
    /// http(s) URL or the defaults cannot be resolved.
    pub fn new(endpoint: &str) -> Result<Self, OutboundError> {
        Self::with_settings(endpoint, current_defaults()?)
    }

    /// Request against `endpoint` using an explicit settings snapshot.
    ///
    /// # Errors
    /// Returns [`OutboundError::Config`] if `endpoint` is not an absolute http(s) URL.
    pub fn with_settings(endpoint: &str, settings: Arc<Settings>) -> Result<Self, OutboundError> {
        let endpoint = validate_endpoint(endpoint)?;

        let mut request = Self {
            endpoint,
            method: Method::GET,
            headers: HeaderMap::new(),
            header_error: None,
            breaker: None,
            statsd: None,
            targets: DecodeTargets::default(),
            apm_segment_name: None,
            transport: None,
            keep_raw: false,
            raw: Bytes::new(),
            mismatch_raw: false,
            duration: Duration::ZERO,
            status: None,
            saturated_by: None,
            is_error: false,
            internal_error: false,
            settings,
        };

        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));
        let user_agent = request.settings.user_agent.clone();
        let service_name = request.settings.service_name.clone();
        request.insert_header(USER_AGENT, &user_agent);
        request.insert_header(CALLING_SERVICE, &service_name);

        Ok(request)
    }

    fn insert_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::try_from(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => {
                if self.header_error.is_none() {
                    self.header_error = Some(e.into());
                }
            }
        }
    }

    /// Set the request content type.
    ///
    /// JSON content types (the default) send `Accept: application/json` and
    /// serialize payloads as JSON. Any other type drops the `Accept` header and
    /// requires payloads to be strings or byte sequences.
    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.insert_header(CONTENT_TYPE, content_type);
        if is_json_content_type(Some(content_type)) {
            self.headers
                .insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));
        } else {
            self.headers.remove(ACCEPT);
        }
        self
    }

    /// Set a custom header, replacing any previous value.
    ///
    /// `Content-Type` is routed through [`set_content_type`](Self::set_content_type).
    /// An invalid name or value is reported by the next verb call.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match HeaderName::try_from(name) {
            Ok(name) if name == CONTENT_TYPE => self.set_content_type(value),
            Ok(name) => {
                self.insert_header(name, value);
                self
            }
            Err(e) => {
                if self.header_error.is_none() {
                    self.header_error = Some(e.into());
                }
                self
            }
        }
    }

    /// Run every exchange of this request inside `breaker`.
    pub fn set_circuit_breaker(&mut self, breaker: Arc<dyn CircuitBreaker>) -> &mut Self {
        self.breaker = Some(breaker);
        self
    }

    /// Emit a counter and a timing sample named `stat` after every exchange.
    pub fn set_statsd(
        &mut self,
        client: Arc<dyn StatsdClient>,
        stat: impl Into<String>,
        tags: Vec<String>,
    ) -> &mut Self {
        self.statsd = Some(StatsdHandle::new(client, stat.into(), tags));
        self
    }

    /// Name used for the APM external segment.
    pub fn set_apm_segment_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.apm_segment_name = Some(name.into());
        self
    }

    /// Use `transport` instead of the one from the settings snapshot.
    pub fn set_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Retain the raw response body, readable through [`raw_response`](Self::raw_response).
    pub fn keep_raw_response(&mut self) -> &mut Self {
        self.keep_raw = true;
        self
    }

    /// Decode 2xx responses into the returned handle.
    pub fn will_saturate<T>(&mut self) -> Saturation<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handle = Saturation::new();
        self.targets.set_success(Arc::new(handle.clone()));
        handle
    }

    /// Decode non-2xx responses into the returned handle.
    pub fn will_saturate_on_error<T>(&mut self) -> Saturation<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handle = Saturation::new();
        self.targets.set_error(Arc::new(handle.clone()));
        handle
    }

    /// Decode responses with exactly `status` into the returned handle.
    ///
    /// Takes precedence over [`will_saturate`](Self::will_saturate) and
    /// [`will_saturate_on_error`](Self::will_saturate_on_error) for that status only.
    pub fn will_saturate_with_status_code<T>(&mut self, status: StatusCode) -> Saturation<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handle = Saturation::new();
        self.targets.set_status(status, Arc::new(handle.clone()));
        handle
    }

    /// Perform a GET.
    ///
    /// # Errors
    /// See [`OutboundError`]; the error's [`status_code`](OutboundError::status_code)
    /// is the status reported for the failed exchange.
    pub async fn get(&mut self, ctx: &RequestContext) -> Result<StatusCode, OutboundError> {
        self.execute::<()>(ctx, Method::GET, None).await
    }

    /// Perform a POST with `payload`.
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub async fn post<P>(
        &mut self,
        ctx: &RequestContext,
        payload: &P,
    ) -> Result<StatusCode, OutboundError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.execute(ctx, Method::POST, Some(payload)).await
    }

    /// Perform a PUT with `payload`.
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub async fn put<P>(
        &mut self,
        ctx: &RequestContext,
        payload: &P,
    ) -> Result<StatusCode, OutboundError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.execute(ctx, Method::PUT, Some(payload)).await
    }

    /// Perform a PATCH with `payload`.
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub async fn patch<P>(
        &mut self,
        ctx: &RequestContext,
        payload: &P,
    ) -> Result<StatusCode, OutboundError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.execute(ctx, Method::PATCH, Some(payload)).await
    }

    /// Perform a DELETE.
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub async fn delete(&mut self, ctx: &RequestContext) -> Result<StatusCode, OutboundError> {
        self.execute::<()>(ctx, Method::DELETE, None).await
    }

    /// Perform a request with an arbitrary method.
    ///
    /// # Errors
    /// Returns [`OutboundError::RequestConstruction`] if `method` is not a valid
    /// HTTP method token; otherwise see [`get`](Self::get).
    pub async fn send<P>(
        &mut self,
        ctx: &RequestContext,
        method: &str,
        payload: Option<&P>,
    ) -> Result<StatusCode, OutboundError>
    where
        P: Serialize + ?Sized + Sync,
    {
        match Method::from_bytes(method.as_bytes()) {
            Ok(method) => self.execute(ctx, method, payload).await,
            Err(e) => {
                let err = OutboundError::RequestConstruction(Box::new(e));
                self.fail_before_dispatch(ctx, err)
            }
        }
    }

    /// Raw body of the last response; empty unless retention is on or the
    /// last response was not JSON while a decode target was registered.
    #[must_use]
    pub fn raw_response(&self) -> Bytes {
        if self.keep_raw || self.mismatch_raw {
            self.raw.clone()
        } else {
            Bytes::new()
        }
    }

    /// Wall time spent in the last verb call.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether the last exchange did not end with a status in `[200, 300)`.
    #[must_use]
    pub fn status_code_is_error(&self) -> bool {
        self.is_error
    }

    /// Status received in the last exchange, if a response arrived.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Which decode target the last response populated.
    #[must_use]
    pub fn saturated_by(&self) -> Option<TargetSlot> {
        self.saturated_by
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    /// Method of the last (or current) exchange.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("endpoint", &self.endpoint)
            .field("method", &self.method)
            .field("status", &self.status)
            .field("is_error", &self.is_error)
            .field("targets", &self.targets)
            .field("statsd", &self.statsd)
            .finish_non_exhaustive()
    }
}

fn validate_endpoint(endpoint: &str) -> Result<Uri, OutboundError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: http::uri::InvalidUri| {
            OutboundError::Config(format!("invalid endpoint '{endpoint}': {e}"))
        })?;

    if uri.authority().is_none() {
        return Err(OutboundError::Config(format!(
            "invalid endpoint '{endpoint}': missing host/authority"
        )));
    }

    match uri.scheme_str() {
        Some("http" | "https") => Ok(uri),
        Some(scheme) => Err(OutboundError::Config(format!(
            "invalid endpoint '{endpoint}': unsupported scheme '{scheme}'"
        ))),
        None => Err(OutboundError::Config(format!(
            "invalid endpoint '{endpoint}': missing scheme"
        ))),
    }
}
