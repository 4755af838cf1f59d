use crate::context::{LoggerProvider, RequestContext, RequestIdProvider, RequestSourceProvider};
use crate::error::OutboundError;
use crate::instrument::{ApmProvider, Tracer, TracingTracer};
use crate::transport::{HyperTransport, Transport};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Statsd tag added when the received status is in `[200, 300)`
pub const DEFAULT_SUCCESS_TAG: &str = "processed:success";

/// Statsd tag added for every other exchange
pub const DEFAULT_FAILURE_TAG: &str = "processed:failure";

/// Environment variable holding the service name
pub const SERVICE_NAME_ENV: &str = "SERVICE_NAME";

/// Environment variable holding the host name
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Transport security mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Only HTTPS URLs are accepted (default)
    #[default]
    TlsOnly,
    /// Plain HTTP is accepted as well; intended for mock servers in tests
    AllowInsecureHttp,
}

/// Timeout and pool settings for the default transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Transport security mode (default: `TlsOnly`)
    pub security: TransportSecurity,

    /// TCP connect timeout (default: 2 seconds)
    pub connect_timeout: Duration,

    /// TLS handshake timeout, on top of the connect timeout (default: 2 seconds)
    pub tls_handshake_timeout: Duration,

    /// TCP keepalive interval (default: 30 seconds, `None` disables it)
    pub tcp_keepalive: Option<Duration>,

    /// Idle pooled connections are closed after this long (default: 10 seconds)
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections kept per host (default: 100)
    pub pool_max_idle_per_host: usize,

    /// Deadline covering the response head and body (default: 8 seconds)
    pub request_timeout: Duration,

    /// Maximum response body size in bytes (default: 10 MiB)
    pub max_body_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            security: TransportSecurity::TlsOnly,
            connect_timeout: Duration::from_secs(2),
            tls_handshake_timeout: Duration::from_secs(2),
            tcp_keepalive: Some(Duration::from_secs(30)),
            pool_idle_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 100,
            request_timeout: Duration::from_secs(8),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    /// Configuration allowing plain HTTP, for tests against local mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            security: TransportSecurity::AllowInsecureHttp,
            ..Self::default()
        }
    }
}

/// Caller-supplied defaults. Unset fields are filled by [`OutboundDefaults::resolve`].
#[derive(Clone, Default)]
pub struct OutboundDefaults {
    pub service_name: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<Arc<dyn RequestIdProvider>>,
    pub request_source: Option<Arc<dyn RequestSourceProvider>>,
    pub apm: Option<Arc<dyn ApmProvider>>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub logger: Option<Arc<dyn LoggerProvider>>,
    /// Reject requests missing a mandated tracing header
    pub strict_compliance: bool,
    /// Statsd sample rate in `(0, 1]`
    pub statsd_rate: Option<f64>,
    pub success_tag: Option<String>,
    pub failure_tag: Option<String>,
    /// Transport used when none is supplied; built from `transport_config` otherwise
    pub transport: Option<Arc<dyn Transport>>,
    pub transport_config: TransportConfig,
}

impl OutboundDefaults {
    /// Fill every unset field with its fallback, logging each one.
    ///
    /// # Errors
    /// Returns [`OutboundError::Config`] if the default transport cannot be built.
    pub fn resolve(self) -> Result<Settings, OutboundError> {
        let hostname = env_var(HOSTNAME_ENV);

        let service_name = self
            .service_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                let name = env_var(SERVICE_NAME_ENV).unwrap_or_else(|| {
                    tracing::warn!(
                        target: "modkit_outbound::defaults",
                        "{SERVICE_NAME_ENV} not set; falling back to {HOSTNAME_ENV}"
                    );
                    hostname.clone().unwrap_or_default()
                });
                tracing::info!(
                    target: "modkit_outbound::defaults",
                    service_name = %name,
                    "no service name provided"
                );
                name
            });

        let user_agent = self
            .user_agent
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                fallback_user_agent(&service_name, hostname.as_deref().unwrap_or_default())
            });

        if self.request_id.is_none() {
            tracing::warn!(
                target: "modkit_outbound::defaults",
                "no request id provider set; Request-ID is only sent when set manually"
            );
        }
        if self.request_source.is_none() {
            tracing::warn!(
                target: "modkit_outbound::defaults",
                "no request source provider set; Request-Source is only sent when set manually"
            );
        }
        if self.apm.is_none() {
            tracing::warn!(target: "modkit_outbound::defaults", "no APM provider set");
        }
        if self.logger.is_none() {
            tracing::warn!(
                target: "modkit_outbound::defaults",
                "no logger provider set; the caller's current span will be used"
            );
        }

        let statsd_rate = self
            .statsd_rate
            .filter(|rate| *rate > 0.0 && *rate <= 1.0)
            .unwrap_or_else(|| {
                tracing::info!(
                    target: "modkit_outbound::defaults",
                    "statsd rate unset or out of range; using 1.0"
                );
                1.0
            });

        let success_tag = self.success_tag.filter(|t| !t.is_empty()).unwrap_or_else(|| {
            tracing::info!(
                target: "modkit_outbound::defaults",
                "no statsd success tag provided; using {DEFAULT_SUCCESS_TAG}"
            );
            DEFAULT_SUCCESS_TAG.to_owned()
        });
        let failure_tag = self.failure_tag.filter(|t| !t.is_empty()).unwrap_or_else(|| {
            tracing::info!(
                target: "modkit_outbound::defaults",
                "no statsd failure tag provided; using {DEFAULT_FAILURE_TAG}"
            );
            DEFAULT_FAILURE_TAG.to_owned()
        });

        let transport = if let Some(transport) = self.transport {
            transport
        } else {
            let transport = HyperTransport::new(&self.transport_config)
                .map_err(|e| OutboundError::Config(format!("default transport: {e}")))?;
            Arc::new(transport) as Arc<dyn Transport>
        };

        Ok(Settings {
            service_name,
            user_agent,
            request_id: self.request_id,
            request_source: self.request_source,
            apm: self.apm,
            tracer: self.tracer.unwrap_or_else(|| Arc::new(TracingTracer)),
            logger: self.logger,
            strict_compliance: self.strict_compliance,
            statsd_rate,
            success_tag,
            failure_tag,
            transport,
        })
    }
}

impl fmt::Debug for OutboundDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundDefaults")
            .field("service_name", &self.service_name)
            .field("user_agent", &self.user_agent)
            .field("strict_compliance", &self.strict_compliance)
            .field("statsd_rate", &self.statsd_rate)
            .field("transport_config", &self.transport_config)
            .finish_non_exhaustive()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// The service name alone when it is the host name, `"{service}-{host}"` otherwise.
fn fallback_user_agent(service_name: &str, hostname: &str) -> String {
    if service_name == hostname {
        service_name.to_owned()
    } else {
        format!("{service_name}-{hostname}")
    }
}

/// Resolved, immutable defaults shared by every request built from them.
#[derive(Clone)]
pub struct Settings {
    pub service_name: String,
    pub user_agent: String,
    pub request_id: Option<Arc<dyn RequestIdProvider>>,
    pub request_source: Option<Arc<dyn RequestSourceProvider>>,
    pub apm: Option<Arc<dyn ApmProvider>>,
    pub tracer: Arc<dyn Tracer>,
    pub logger: Option<Arc<dyn LoggerProvider>>,
    pub strict_compliance: bool,
    pub statsd_rate: f64,
    pub success_tag: String,
    pub failure_tag: String,
    pub transport: Arc<dyn Transport>,
}

impl Settings {
    /// Span the execution core logs under for `ctx`.
    #[must_use]
    pub fn logger_span(&self, ctx: &RequestContext) -> tracing::Span {
        self.logger
            .as_ref()
            .and_then(|provider| provider.logger(ctx))
            .unwrap_or_else(tracing::Span::current)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("service_name", &self.service_name)
            .field("user_agent", &self.user_agent)
            .field("strict_compliance", &self.strict_compliance)
            .field("statsd_rate", &self.statsd_rate)
            .field("success_tag", &self.success_tag)
            .field("failure_tag", &self.failure_tag)
            .finish_non_exhaustive()
    }
}

static PROCESS_DEFAULTS: RwLock<Option<Arc<Settings>>> = RwLock::new(None);

/// Resolve `defaults` and install them process-wide, replacing any earlier value.
///
/// # Errors
/// Returns [`OutboundError::Config`] if resolution fails; the previous value is kept.
pub fn set_defaults(defaults: OutboundDefaults) -> Result<Arc<Settings>, OutboundError> {
    let settings = Arc::new(defaults.resolve()?);
    *PROCESS_DEFAULTS.write() = Some(Arc::clone(&settings));
    Ok(settings)
}

/// The process-wide defaults, resolving fallbacks on first use.
///
/// # Errors
/// Returns [`OutboundError::Config`] if the fallback defaults cannot be resolved.
pub fn current_defaults() -> Result<Arc<Settings>, OutboundError> {
    if let Some(settings) = PROCESS_DEFAULTS.read().as_ref() {
        return Ok(Arc::clone(settings));
    }

    let mut slot = PROCESS_DEFAULTS.write();
    // Another caller may have filled the slot between the two locks
    if let Some(settings) = slot.as_ref() {
        return Ok(Arc::clone(settings));
    }
    let settings = Arc::new(OutboundDefaults::default().resolve()?);
    *slot = Some(Arc::clone(&settings));
    Ok(settings)
}
