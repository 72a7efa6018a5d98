use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::RequestHeaders;
use super::line::{read_bounded_line, read_line_with_deadline};

pub(crate) struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: RequestHeaders,
    pub request_line_bytes: usize,
    pub header_bytes: usize,
}

/// Waits up to `idle_timeout` for the first byte, then reads the whole head within
/// `header_timeout`. The request line and headers share `max_header_bytes`.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let first = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(read) => read.with_context(|| format!("waiting for request data from {peer}"))?,
        Err(_) => return Ok(None),
    };
    if first.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let Some(raw_line) =
        read_bounded_line(reader, deadline, peer, max_header_bytes, "request line").await?
    else {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    };
    let request_line_bytes = raw_line.len();
    let (method, target, version) = parse_request_line(raw_line.trim_end_matches(['\r', '\n']))?;

    let remaining = max_header_bytes.saturating_sub(request_line_bytes);
    ensure!(remaining > 0, "request headers exceed configured limit");
    let mut headers = RequestHeaders::new(remaining)?;
    let mut line = String::new();
    while read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await? > 0 {
        let more = headers
            .push_line(&line)
            .with_context(|| format!("invalid header from {peer}"))?;
        if !more {
            break;
        }
    }

    Ok(Some(Http1RequestHead {
        method,
        target,
        version,
        header_bytes: headers.total_bytes(),
        headers,
        request_line_bytes,
    }))
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    ensure!(!line.is_empty(), "empty request line");
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line '{line}'");
    };
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data after version");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(anyhow!("unsupported HTTP version '{other}'")),
    };
    let method =
        Method::from_bytes(method.as_bytes()).with_context(|| format!("invalid method '{method}'"))?;
    Ok((method, target.to_string(), version))
}
