use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TEXT_FORMAT, TextEncoder,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::util::timeout_with_context;

pub const METRICS_PATH: &str = "/metrics";
const MAX_SCRAPE_REQUEST_BYTES: u64 = 8192;
const SCRAPE_READ_TIMEOUT: Duration = Duration::from_secs(5);

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register counter");
    counter
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register counter vec");
    vec
}

static REQUESTS_BY_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "requests_status_total",
        "Proxied requests by response status class",
        &["status_class"],
    )
});

static REQUESTS_BY_METHOD: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("requests_method_total", "Proxied requests by method", &["method"]));

static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // Video transfers run long; the upper buckets cover whole downloads.
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Time from request head to connection close, by cache lookup result",
    )
    .buckets(vec![
        0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]);
    let vec = HistogramVec::new(opts, &["cache_lookup"]).expect("valid histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register histogram vec");
    vec
});

static INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("inflight_requests", "Client connections being served")
        .expect("valid gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register gauge");
    gauge
});

static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cache_lookup_total",
        "Video cache lookups by result",
        &["result"],
    )
});

static CACHE_STORES: Lazy<IntCounter> =
    Lazy::new(|| counter("cache_store_total", "Video cache entries published"));

static CACHE_STORE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "cache_store_errors_total",
        "Video cache writes that failed or were abandoned",
    )
});

static CACHE_SKIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cache_skips_total",
        "Video responses not stored, by reason",
        &["reason"],
    )
});

static CACHE_INVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "cache_invalidations_total",
        "Secondary entries removed after a primary was stored",
    )
});

static TITLES_RECORDED: Lazy<IntCounter> =
    Lazy::new(|| counter("titles_recorded_total", "Titles learned from watch pages"));

static UPSTREAM_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "upstream_errors_total",
        "Failed upstream exchanges by kind",
        &["kind"],
    )
});

fn status_class(status: Option<StatusCode>) -> &'static str {
    match status.map(|status| status.as_u16()) {
        Some(200..=299) => "2xx",
        Some(300..=399) => "3xx",
        Some(400..=499) => "4xx",
        Some(500..=599) => "5xx",
        _ => "other",
    }
}

pub fn inc_inflight() {
    INFLIGHT.inc();
}

pub fn dec_inflight() {
    INFLIGHT.dec();
}

/// Records one finished client transaction. `status` is `None` when nothing was answered.
pub fn record_request(
    method: &str,
    cache_lookup: &str,
    status: Option<StatusCode>,
    elapsed: Duration,
) {
    let method = if method.is_empty() { "unknown" } else { method };
    REQUESTS_BY_STATUS
        .with_label_values(&[status_class(status)])
        .inc();
    REQUESTS_BY_METHOD.with_label_values(&[method]).inc();
    REQUEST_DURATION
        .with_label_values(&[cache_lookup])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORES.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS.inc();
}

pub fn record_cache_skip(reason: &str) {
    CACHE_SKIPS.with_label_values(&[reason]).inc();
}

pub fn record_cache_invalidation(removed: u64) {
    CACHE_INVALIDATIONS.inc_by(removed);
}

pub fn record_title_recorded() {
    TITLES_RECORDED.inc();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS.with_label_values(&[kind]).inc();
}

/// Current registry contents in the Prometheus text format.
pub fn gather() -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the registry on `GET /metrics`, one request per connection.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "metrics endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) =
                answer_scrape(stream, SCRAPE_READ_TIMEOUT, MAX_SCRAPE_REQUEST_BYTES).await
            {
                tracing::debug!(peer = %peer, error = %err, "metrics request failed");
            }
        });
    }
}

async fn answer_scrape<S>(stream: S, read_timeout: Duration, max_bytes: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half.take(max_bytes));

    let mut request_line = String::new();
    let read = timeout_with_context(
        read_timeout,
        reader.read_line(&mut request_line),
        "reading metrics request",
    )
    .await?;
    if read == 0 {
        return Ok(());
    }

    let mut line = String::new();
    loop {
        line.clear();
        let read = timeout_with_context(
            read_timeout,
            reader.read_line(&mut line),
            "reading metrics request",
        )
        .await?;
        if read == 0 {
            bail!("metrics request ended before its blank line (limit {max_bytes} bytes)");
        }
        if line.trim_end().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let (status, content_type, body) = if method == Method::GET.as_str() && path == METRICS_PATH
    {
        (StatusCode::OK, TEXT_FORMAT, gather())
    } else {
        (StatusCode::NOT_FOUND, "text/plain", b"not found\n".to_vec())
    };

    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    write_half.write_all(&response).await?;
    write_half.shutdown().await?;
    Ok(())
}
