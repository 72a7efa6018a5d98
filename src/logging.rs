use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::field::display;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

pub const ACCESS_LOG_TARGET: &str = "access_log";

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => subscriber.with_target(false).compact().try_init(),
    }
    .map_err(|err| anyhow!(err))
}

/// Fields of one access log line. Every client connection produces exactly one.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client: SocketAddr,
    pub method: String,
    /// Absolute URL of the request, or the raw target when it could not be parsed.
    pub url: String,
    pub status: Option<StatusCode>,
    /// `hit`, `miss` or `bypass`.
    pub cache_lookup: Option<&'static str>,
    /// What the cache did with the response body, when it looked at it at all.
    pub cache_store: Option<&'static str>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
    pub upstream: Option<SocketAddr>,
    pub error_reason: Option<&'static str>,
    pub error_detail: Option<String>,
}

/// Collects access log fields while a connection is served. Consumed by [`log`](Self::log).
#[derive(Debug)]
pub struct AccessLogBuilder(AccessLogEvent);

impl AccessLogBuilder {
    pub fn new(client: SocketAddr) -> Self {
        Self(AccessLogEvent {
            client,
            method: String::new(),
            url: String::new(),
            status: None,
            cache_lookup: None,
            cache_store: None,
            bytes_in: 0,
            bytes_out: 0,
            elapsed: Duration::ZERO,
            upstream: None,
            error_reason: None,
            error_detail: None,
        })
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.0.method = method.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.0.url = url.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.0.status = Some(status);
        self
    }

    pub fn cache_lookup(mut self, lookup: &'static str) -> Self {
        self.0.cache_lookup = Some(lookup);
        self
    }

    pub fn cache_store(mut self, store: &'static str) -> Self {
        self.0.cache_store = Some(store);
        self
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.0.bytes_in = bytes_in;
        self.0.bytes_out = bytes_out;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.0.elapsed = elapsed;
        self
    }

    pub fn upstream_addr(mut self, addr: SocketAddr) -> Self {
        self.0.upstream = Some(addr);
        self
    }

    pub fn error_reason(mut self, reason: &'static str) -> Self {
        self.0.error_reason = Some(reason);
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.0.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.0
    }

    pub fn log(self) {
        log_access(self.0);
    }
}

/// Emits the event under [`ACCESS_LOG_TARGET`] and feeds the request metrics.
pub fn log_access(event: AccessLogEvent) {
    let ts = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    tracing::info!(
        target: ACCESS_LOG_TARGET,
        ts,
        client = %event.client,
        method = %event.method,
        url = %event.url,
        status = event.status.map(|status| status.as_u16()),
        cache_lookup = event.cache_lookup,
        cache_store = event.cache_store,
        bytes_in = event.bytes_in,
        bytes_out = event.bytes_out,
        elapsed_ms = event.elapsed.as_millis() as u64,
        upstream = event.upstream.as_ref().map(display),
        error_reason = event.error_reason,
        error_detail = event.error_detail.as_deref(),
        "request complete"
    );

    crate::metrics::record_request(
        &event.method,
        event.cache_lookup.unwrap_or("none"),
        event.status,
        event.elapsed,
    );
}
