//! Caller-supplied request context and the providers resolved from it.
//!
//! A [`RequestContext`] carries typed values (inserted by the caller's
//! middleware) and a cancellation token. Providers are single-method traits;
//! any `Fn(&RequestContext) -> Option<_>` closure implements them.

use http::Extensions;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to every verb.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    extensions: Extensions,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Empty context that is never cancelled unless its token is.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            extensions: Extensions::new(),
            cancellation: token,
        }
    }

    /// Attach a typed value, consuming and returning the context.
    #[must_use]
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Attach a typed value, returning the previous value of that type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Request-tracing id carried in a [`RequestContext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Originating request source carried in a [`RequestContext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSource(pub String);

/// Supplies the `Request-ID` header value.
pub trait RequestIdProvider: Send + Sync {
    fn request_id(&self, ctx: &RequestContext) -> Option<String>;
}

impl<F> RequestIdProvider for F
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    fn request_id(&self, ctx: &RequestContext) -> Option<String> {
        self(ctx)
    }
}

/// Supplies the `Request-Source` header value.
pub trait RequestSourceProvider: Send + Sync {
    fn request_source(&self, ctx: &RequestContext) -> Option<String>;
}

impl<F> RequestSourceProvider for F
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    fn request_source(&self, ctx: &RequestContext) -> Option<String> {
        self(ctx)
    }
}

/// Supplies the span the execution core logs under.
pub trait LoggerProvider: Send + Sync {
    fn logger(&self, ctx: &RequestContext) -> Option<tracing::Span>;
}

impl<F> LoggerProvider for F
where
    F: Fn(&RequestContext) -> Option<tracing::Span> + Send + Sync,
{
    fn logger(&self, ctx: &RequestContext) -> Option<tracing::Span> {
        self(ctx)
    }
}

/// Reads [`RequestId`] and [`RequestSource`] straight from the context.
#[derive(Clone, Copy, Debug, Default)]
pub struct FromExtensions;

impl RequestIdProvider for FromExtensions {
    fn request_id(&self, ctx: &RequestContext) -> Option<String> {
        ctx.get::<RequestId>().map(|id| id.0.clone())
    }
}

impl RequestSourceProvider for FromExtensions {
    fn request_source(&self, ctx: &RequestContext) -> Option<String> {
        ctx.get::<RequestSource>().map(|source| source.0.clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_extensions_round_trip() {
        let ctx = RequestContext::new().with(RequestId("req-1".to_owned()));
        assert_eq!(ctx.get::<RequestId>(), Some(&RequestId("req-1".to_owned())));
        assert!(ctx.get::<RequestSource>().is_none());
    }

    #[test]
    fn test_insert_returns_previous() {
        let mut ctx = RequestContext::new();
        assert!(ctx.insert(RequestSource("a".to_owned())).is_none());
        let previous = ctx.insert(RequestSource("b".to_owned()));
        assert_eq!(previous, Some(RequestSource("a".to_owned())));
    }

    #[test]
    fn test_closure_providers() {
        let provider = |ctx: &RequestContext| ctx.get::<u32>().map(ToString::to_string);
        let ctx = RequestContext::new().with(42_u32);
        assert_eq!(RequestIdProvider::request_id(&provider, &ctx), Some("42".to_owned()));
        assert_eq!(
            RequestIdProvider::request_id(&provider, &RequestContext::new()),
            None
        );
    }

    #[test]
    fn test_from_extensions_provider() {
        let ctx = RequestContext::new()
            .with(RequestId("abc".to_owned()))
            .with(RequestSource("web".to_owned()));
        assert_eq!(FromExtensions.request_id(&ctx), Some("abc".to_owned()));
        assert_eq!(FromExtensions.request_source(&ctx), Some("web".to_owned()));
    }

    #[test]
    fn test_cancellation_shared_with_token() {
        let token = CancellationToken::new();
        let ctx = RequestContext::with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cancellation_token().is_cancelled());
    }
}
