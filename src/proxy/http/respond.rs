use std::time::Duration;

use anyhow::Result;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

use super::codec::encode_local_http1_head;

/// Answers with a short plain-text body, writes the access log line and closes the stream.
pub(super) async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let sent = send_response(stream, status, body, timeout_dur).await;
    log.status(status)
        .bytes(bytes_in, *sent.as_ref().unwrap_or(&0))
        .elapsed(elapsed)
        .log();
    sent?;
    shutdown_stream(stream, timeout_dur).await
}

async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    let mut message = encode_local_http1_head(status, &headers);
    message.extend_from_slice(body);
    write_all_with_timeout(stream, &message, timeout_dur, "writing local response").await?;
    Ok(message.len() as u64)
}

pub(super) async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.shutdown(), "closing client connection").await
}
