use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheLookupOutcome, ResponseTap, parse_watch_url};
use crate::proxy::forward_error::{
    ForwardErrorKind, UpstreamError, classify_forward_error, log_forward_error,
};
use crate::proxy::request::ParsedRequest;

use super::body::{BodyPlan, RelayTimeouts, relay_request_body, relay_response_body};
use super::codec::{
    Http1ResponseHead, RequestHeaders, ResponseBodyPlan, determine_response_body_plan,
    read_final_response_head,
};
use super::respond::{respond_with_access_log, shutdown_stream};

/// One request on its way to the origin.
pub(super) struct ForwardRequest<'a> {
    pub request: &'a ParsedRequest,
    pub headers: &'a RequestHeaders,
    pub body_plan: BodyPlan,
    pub expect_continue: bool,
    /// The client only speaks HTTP/1.0 and cannot take a chunked body.
    pub dechunk: bool,
    pub lookup: &'a CacheLookupOutcome,
    pub peer: SocketAddr,
    pub bytes_in: u64,
    pub start: Instant,
}

pub(super) async fn forward_request<S>(
    client_reader: &mut BufReader<S>,
    app: &AppContext,
    forward: ForwardRequest<'_>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let request = forward.request;
    let url = request.url();
    let log = request
        .access_log_builder(forward.peer)
        .cache_lookup(forward.lookup.as_str());

    let (mut upstream, upstream_addr, head, request_body_bytes) =
        match exchange_head(client_reader, app, &forward, &url).await {
            Ok(exchange) => exchange,
            Err(err) => {
                let kind = classify_forward_error(&err);
                log_forward_error(&kind, forward.peer, &request.host, &err);
                let status = match kind {
                    ForwardErrorKind::Upstream(upstream) => upstream.status(),
                    ForwardErrorKind::Other => StatusCode::BAD_GATEWAY,
                };
                respond_with_access_log(
                    client_reader.get_mut(),
                    status,
                    b"upstream request failed\n",
                    settings.client_timeout(),
                    forward.bytes_in,
                    forward.start.elapsed(),
                    log.error_reason("upstream_failed")
                        .error_detail(format!("{err:#}")),
                )
                .await?;
                return Ok(());
            }
        };
    let bytes_in = forward.bytes_in.saturating_add(request_body_bytes);
    let log = log.status(head.status).upstream_addr(upstream_addr);

    let header_map = head.header_map();
    let mut tap = app.cache.tap_response(&url, head.status, &header_map).await;

    let plan = determine_response_body_plan(&request.method, &head);
    let client_plan = match plan {
        ResponseBodyPlan::Chunked if forward.dechunk => ResponseBodyPlan::UntilClose,
        other => other,
    };
    let encoded = head.encode(client_plan);
    let client = client_reader.get_mut();

    let relayed = relay_response(
        client,
        &mut upstream,
        &encoded,
        plan,
        RelayTimeouts {
            read: settings.upstream_timeout(),
            write: settings.client_timeout(),
        },
        upstream_addr,
        &mut tap,
        forward.dechunk,
    )
    .await;
    let transfer_ok = relayed.is_ok();
    let outcome = tap.complete(&app.cache, transfer_ok).await;
    let log = log.cache_store(outcome.as_str());

    match relayed {
        Ok(body_bytes) => {
            log.bytes(bytes_in, encoded.len() as u64 + body_bytes)
                .elapsed(forward.start.elapsed())
                .log();
            shutdown_stream(client, settings.client_timeout()).await
        }
        Err(err) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, forward.peer, &request.host, &err);
            log.bytes(bytes_in, 0)
                .elapsed(forward.start.elapsed())
                .error_reason("transfer_aborted")
                .error_detail(format!("{err:#}"))
                .log();
            Err(err)
        }
    }
}

/// Connects, sends the request with its body and reads the final response head.
async fn exchange_head<S>(
    client_reader: &mut BufReader<S>,
    app: &AppContext,
    forward: &ForwardRequest<'_>,
    url: &str,
) -> Result<(BufReader<TcpStream>, SocketAddr, Http1ResponseHead, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let target = forward.request.connect_target();
    let (mut stream, upstream_addr) =
        connect_upstream(&target, settings.upstream_connect_timeout()).await?;

    let strip_accept_encoding = parse_watch_url(url).is_some();
    let request_bytes = build_upstream_request(
        forward.request,
        forward.headers,
        &forward.body_plan,
        forward.expect_continue,
        strip_accept_encoding,
    );
    write_all_with_timeout(
        &mut stream,
        &request_bytes,
        settings.upstream_timeout(),
        "sending request headers to upstream",
    )
    .await?;

    send_continue_if_needed(
        client_reader.get_mut(),
        forward.expect_continue,
        forward.body_plan,
        settings.client_timeout(),
    )
    .await?;

    let body_bytes = relay_request_body(
        client_reader,
        &mut stream,
        forward.body_plan,
        RelayTimeouts {
            read: settings.client_timeout(),
            write: settings.upstream_timeout(),
        },
        forward.peer,
    )
    .await?;
    flush_with_timeout(
        &mut stream,
        settings.upstream_timeout(),
        "flushing request to upstream",
    )
    .await?;

    let mut upstream = BufReader::new(stream);
    let head = read_final_response_head(
        &mut upstream,
        settings.upstream_timeout(),
        upstream_addr,
        settings.max_response_header_size,
    )
    .await
    .map_err(|err| UpstreamError::InvalidResponse {
        target: target.clone(),
        detail: format!("{err:#}"),
    })?;
    debug!(upstream = %upstream_addr, status = head.status.as_u16(), "received upstream response head");
    Ok((upstream, upstream_addr, head, body_bytes))
}

#[allow(clippy::too_many_arguments)]
async fn relay_response<C>(
    client: &mut C,
    upstream: &mut BufReader<TcpStream>,
    encoded_head: &[u8],
    plan: ResponseBodyPlan,
    timeouts: RelayTimeouts,
    upstream_addr: SocketAddr,
    tap: &mut ResponseTap,
    dechunk: bool,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    write_all_with_timeout(
        client,
        encoded_head,
        timeouts.write,
        "writing response head to client",
    )
    .await?;
    let body_bytes =
        relay_response_body(upstream, client, plan, timeouts, upstream_addr, tap, dechunk).await?;
    flush_with_timeout(client, timeouts.write, "flushing response to client").await?;
    Ok(body_bytes)
}

async fn connect_upstream(
    target: &str,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr), Error> {
    let stream = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(UpstreamError::Connect {
                target: target.to_string(),
                source,
            }
            .into());
        }
        Err(_) => {
            return Err(UpstreamError::ConnectTimeout {
                target: target.to_string(),
            }
            .into());
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!(target, error = %err, "failed to set TCP_NODELAY on upstream stream");
    }
    let addr = stream.peer_addr().map_err(|source| UpstreamError::Connect {
        target: target.to_string(),
        source,
    })?;
    debug!(target, upstream = %addr, "connected to upstream");
    Ok((stream, addr))
}

/// Origin-form request head for the upstream. The proxy always asks for `Connection: close`.
pub(crate) fn build_upstream_request(
    request: &ParsedRequest,
    headers: &RequestHeaders,
    body_plan: &BodyPlan,
    expect_continue: bool,
    strip_accept_encoding: bool,
) -> Vec<u8> {
    let dropped = |key: &str| {
        (expect_continue && key == "expect") || (strip_accept_encoding && key == "accept-encoding")
    };
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        request.method,
        request.path,
        request.authority_host()
    );
    for field in headers.forward_headers().filter(|field| !dropped(field.key())) {
        head.push_str(&field.name);
        head.push_str(": ");
        head.push_str(&field.value);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n");
    match body_plan {
        BodyPlan::Fixed(length) => head.push_str(&format!("Content-Length: {length}\r\n")),
        BodyPlan::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        BodyPlan::Empty => {}
    }
    head.push_str("\r\n");
    head.into_bytes()
}

async fn send_continue_if_needed<S>(
    client: &mut S,
    expect_continue: bool,
    body_plan: BodyPlan,
    timeout_dur: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if !expect_continue || matches!(body_plan, BodyPlan::Empty) {
        return Ok(());
    }

    write_all_with_timeout(
        client,
        b"HTTP/1.1 100 Continue\r\n\r\n",
        timeout_dur,
        "sending 100 Continue to client",
    )
    .await?;
    client.flush().await?;
    Ok(())
}
