use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::proxy::headers::{
    ConnectionTokens, HeaderBudget, HeaderField, fields_to_map, is_hop_by_hop,
    record_content_length,
};

use super::line::read_line_with_timeout;

/// How the body following a response head is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseBodyPlan {
    Chunked,
    Fixed(u64),
    Empty,
    UntilClose,
}

pub(crate) struct Http1ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<HeaderField>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encoding_present: bool,
}

impl Http1ResponseHead {
    /// Re-encodes the head for the client as HTTP/1.1 with `Connection: close`, framing the
    /// body according to `body_plan`.
    pub fn encode(&self, body_plan: ResponseBodyPlan) -> Vec<u8> {
        let mut out = status_line(self.status, &self.reason);
        let connection: ConnectionTokens = self.headers.iter().collect();
        let relayed = self.headers.iter().filter(|field| {
            !connection.excludes(field)
                && !matches!(field.key(), "content-length" | "transfer-encoding")
        });
        for field in relayed {
            push_header(&mut out, &field.name, field.value.as_bytes());
        }

        let length = match body_plan {
            ResponseBodyPlan::Fixed(length) => Some(length),
            // HEAD and 304 answers keep the length the origin announced.
            ResponseBodyPlan::Empty => self.content_length,
            ResponseBodyPlan::Chunked | ResponseBodyPlan::UntilClose => None,
        };
        if let Some(length) = length {
            push_header(&mut out, "Content-Length", length.to_string().as_bytes());
        }
        if body_plan == ResponseBodyPlan::Chunked {
            push_header(&mut out, "Transfer-Encoding", b"chunked");
        }
        finish_head(out)
    }

    pub fn header_map(&self) -> HeaderMap {
        fields_to_map(&self.headers)
    }
}

/// Encodes a response head the proxy produced itself.
pub(crate) fn encode_local_http1_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = status_line(status, status.canonical_reason().unwrap_or_default());
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            push_header(&mut out, name.as_str(), value.as_bytes());
        }
    }
    finish_head(out)
}

fn status_line(status: StatusCode, reason: &str) -> Vec<u8> {
    let mut line = format!("HTTP/1.1 {}", status.as_u16());
    if !reason.is_empty() {
        line.push(' ');
        line.push_str(reason);
    }
    line.push_str("\r\n");
    line.into_bytes()
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn finish_head(mut out: Vec<u8>) -> Vec<u8> {
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

pub(crate) fn determine_response_body_plan(
    method: &Method,
    head: &Http1ResponseHead,
) -> ResponseBodyPlan {
    let bodiless = matches!(
        head.status,
        StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
    );
    if method == Method::HEAD || bodiless || head.status.is_informational() {
        ResponseBodyPlan::Empty
    } else if head.chunked {
        ResponseBodyPlan::Chunked
    } else {
        match head.content_length {
            None => ResponseBodyPlan::UntilClose,
            Some(0) => ResponseBodyPlan::Empty,
            Some(length) => ResponseBodyPlan::Fixed(length),
        }
    }
}

/// Reads response heads until a final (non-1xx) one arrives. Interim responses are dropped
/// since the client already got its own `100 Continue`.
pub(crate) async fn read_final_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_http1_response_head(reader, timeout_dur, peer, max_header_bytes).await?;
        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            bail!("upstream attempted protocol upgrade (101 Switching Protocols)");
        }
        if !head.status.is_informational() {
            return Ok(head);
        }
        ensure!(
            !head.transfer_encoding_present && head.content_length.unwrap_or(0) == 0,
            "informational response must not include a body"
        );
        debug!(peer = %peer, status = head.status.as_u16(), "skipping interim response");
    }
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut budget = HeaderBudget::new(
        max_header_bytes,
        "upstream response headers exceed configured limit",
    )?;
    let mut line = String::new();

    if read_line_with_timeout(reader, &mut line, timeout_dur, peer, max_header_bytes).await? == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget.record(line.len())?;
    let (_, status, reason) = parse_http1_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut head = Http1ResponseHead {
        status,
        reason,
        headers: Vec::new(),
        content_length: None,
        chunked: false,
        transfer_encoding_present: false,
    };
    loop {
        if read_line_with_timeout(reader, &mut line, timeout_dur, peer, max_header_bytes).await?
            == 0
        {
            bail!("upstream closed connection during headers");
        }
        budget.record(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let field = HeaderField::parse(trimmed).context("malformed upstream header")?;
        match field.key() {
            "content-length" => record_content_length(&mut head.content_length, &field.value)
                .context("upstream response framing")?,
            "transfer-encoding" => {
                head.transfer_encoding_present = true;
                head.chunked |= field.value.to_ascii_lowercase().contains("chunked");
            }
            _ => {}
        }
        head.headers.push(field);
    }

    if head.transfer_encoding_present && head.content_length.is_some() {
        warn!(peer = %peer, "upstream sent both Transfer-Encoding and Content-Length");
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }
    Ok(head)
}

pub(crate) fn parse_http1_status_line(line: &str) -> Result<(Version, StatusCode, String)> {
    let (version, rest) = line
        .split_once(' ')
        .ok_or_else(|| anyhow!("malformed upstream status line '{line}'"))?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };
    let rest = rest.trim_start();
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid upstream status code '{code}'"))?;
    Ok((version, status, reason.trim().to_string()))
}
