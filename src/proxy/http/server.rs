use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::metrics;
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheLookupOutcome, CachedVideo};
use crate::proxy::request::{ParsedRequest, parse_http1_request};

use super::body::BodyPlan;
use super::codec::{RequestHeaders, read_http1_request_head};
use super::forward::{ForwardRequest, forward_request};
use super::respond::{respond_with_access_log, shutdown_stream};
use super::serve::serve_cached_video;

pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    metrics::inc_inflight();
    let result = serve_connection(stream, peer, &app).await;
    metrics::dec_inflight();
    result
}

/// A request answered by the proxy itself with an error status.
#[derive(Debug)]
struct Rejection {
    status: StatusCode,
    body: &'static [u8],
    reason: &'static str,
    detail: Option<String>,
}

impl Rejection {
    fn new(status: StatusCode, body: &'static [u8], reason: &'static str) -> Self {
        Self {
            status,
            body,
            reason,
            detail: None,
        }
    }

    fn because(mut self, err: &anyhow::Error) -> Self {
        self.detail = Some(format!("{err:#}"));
        self
    }

    async fn send<C>(
        self,
        client: &mut C,
        timeout: Duration,
        log: AccessLogBuilder,
        bytes_in: u64,
        start: Instant,
    ) -> Result<()>
    where
        C: AsyncWrite + Unpin,
    {
        let mut log = log.error_reason(self.reason);
        if let Some(detail) = self.detail {
            log = log.error_detail(detail);
        }
        respond_with_access_log(
            client,
            self.status,
            self.body,
            timeout,
            bytes_in,
            start.elapsed(),
            log,
        )
        .await
    }
}

/// A request the proxy will serve, from disk or from the origin.
struct Admitted {
    request: ParsedRequest,
    body_plan: BodyPlan,
    expect_continue: bool,
}

fn admit(method: &Method, target: &str, headers: &RequestHeaders) -> Result<Admitted, Rejection> {
    if method == Method::CONNECT {
        return Err(Rejection::new(
            StatusCode::NOT_IMPLEMENTED,
            b"CONNECT is not supported\n",
            "connect_unsupported",
        ));
    }
    let expect_continue = headers.expect_continue().map_err(|err| {
        Rejection::new(
            StatusCode::EXPECTATION_FAILED,
            b"expectation failed\n",
            "expectation_failed",
        )
        .because(&err)
    })?;
    let request = parse_http1_request(method.clone(), target, headers.host()).map_err(|err| {
        Rejection::new(
            StatusCode::BAD_REQUEST,
            b"invalid request target\n",
            "bad_request",
        )
        .because(&err)
    })?;
    let body_plan = match headers.content_length() {
        _ if headers.is_chunked() => BodyPlan::Chunked,
        Some(length) if length > 0 => BodyPlan::Fixed(length),
        _ => BodyPlan::Empty,
    };
    Ok(Admitted {
        request,
        body_plan,
        expect_continue,
    })
}

/// Handles exactly one request on `stream`; every response ends with the connection closing.
pub(crate) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: &AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let client_timeout = settings.client_timeout();
    let mut reader = BufReader::new(stream);
    let start = Instant::now();

    let head = match read_http1_request_head(
        &mut reader,
        peer,
        client_timeout,
        client_timeout,
        settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => {
            debug!(peer = %peer, "connection closed without a request");
            return Ok(());
        }
        Err(err) => {
            warn!(peer = %peer, error = %err, "failed to read request head");
            let rejection =
                Rejection::new(StatusCode::BAD_REQUEST, b"malformed request\n", "bad_request")
                    .because(&err);
            let log = AccessLogBuilder::new(peer);
            return rejection
                .send(reader.get_mut(), client_timeout, log, 0, start)
                .await;
        }
    };

    let bytes_in = (head.request_line_bytes + head.header_bytes) as u64;
    let Admitted {
        request,
        body_plan,
        expect_continue,
    } = match admit(&head.method, &head.target, &head.headers) {
        Ok(admitted) => admitted,
        Err(rejection) => {
            debug!(
                peer = %peer,
                target = %head.target,
                reason = rejection.reason,
                "request rejected"
            );
            let log = AccessLogBuilder::new(peer)
                .method(head.method.as_str())
                .url(head.target.as_str());
            return rejection
                .send(reader.get_mut(), client_timeout, log, bytes_in, start)
                .await;
        }
    };

    let lookup = match app.cache.resolve(&request.method, &request.url()).await {
        CacheLookupOutcome::Hit(video) => {
            let log = request.access_log_builder(peer).cache_lookup("hit");
            return serve_hit(reader.get_mut(), *video, app, log, bytes_in, start).await;
        }
        other => other,
    };

    forward_request(
        &mut reader,
        app,
        ForwardRequest {
            request: &request,
            headers: &head.headers,
            body_plan,
            expect_continue,
            dechunk: head.version == Version::HTTP_10,
            lookup: &lookup,
            peer,
            bytes_in,
            start,
        },
    )
    .await
}

async fn serve_hit<C>(
    client: &mut C,
    video: CachedVideo,
    app: &AppContext,
    log: AccessLogBuilder,
    bytes_in: u64,
    start: Instant,
) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let log = log.status(StatusCode::OK);
    match serve_cached_video(client, video, client_timeout).await {
        Ok(bytes_out) => {
            log.bytes(bytes_in, bytes_out)
                .elapsed(start.elapsed())
                .log();
            shutdown_stream(client, client_timeout).await
        }
        Err(err) => {
            warn!(error = %err, "cached transfer aborted");
            log.bytes(bytes_in, 0)
                .elapsed(start.elapsed())
                .error_reason("cached_transfer_aborted")
                .error_detail(format!("{err:#}"))
                .log();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::proxy::cache::VideoCache;
    use crate::settings::Settings;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    async fn app_for(cache_dir: &Path) -> Result<AppContext> {
        let settings = Settings {
            listen: "127.0.0.1:0".parse()?,
            cache_dir: cache_dir.to_path_buf(),
            client_timeout: 2,
            upstream_connect_timeout: 1,
            upstream_timeout: 2,
            max_title_scan_bytes: 4096,
            ..Settings::default()
        };
        let cache = VideoCache::new(cache_dir.to_path_buf(), settings.max_title_scan_bytes).await?;
        Ok(AppContext::new(Arc::new(settings), cache))
    }

    async fn exchange(app: &AppContext, request: &[u8]) -> Result<Vec<u8>> {
        let (mut client, server) = duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse()?;
        client.write_all(request).await?;
        let (served, response) = tokio::join!(serve_connection(server, peer, app), async {
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.map(|_| response)
        });
        served?;
        Ok(response?)
    }

    #[tokio::test]
    async fn connect_is_not_implemented() -> Result<()> {
        let dir = TempDir::new()?;
        let app = app_for(dir.path()).await?;
        let response = exchange(
            &app,
            b"CONNECT www.nicovideo.jp:443 HTTP/1.1\r\nHost: www.nicovideo.jp:443\r\n\r\n",
        )
        .await?;
        assert!(String::from_utf8(response)?.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_request_line_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let app = app_for(dir.path()).await?;
        let response = exchange(&app, b"NOT A REQUEST\r\n\r\n").await?;
        assert!(String::from_utf8(response)?.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn https_absolute_target_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let app = app_for(dir.path()).await?;
        let response = exchange(
            &app,
            b"GET https://www.nicovideo.jp/ HTTP/1.1\r\nHost: www.nicovideo.jp\r\n\r\n",
        )
        .await?;
        assert!(String::from_utf8(response)?.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn stored_video_is_served_without_upstream() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("sm42-Answer.flv"), b"FLV-BYTES")?;
        let app = app_for(dir.path()).await?;
        let response = exchange(
            &app,
            b"GET http://smile-b.nicovideo.jp/smile?v=42.1 HTTP/1.1\r\nHost: smile-b.nicovideo.jp\r\n\r\n",
        )
        .await?;
        let text = String::from_utf8(response)?;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected response: {text}");
        assert!(text.to_ascii_lowercase().contains("x-nicocache: hit\r\n"));
        assert!(text.ends_with("\r\n\r\nFLV-BYTES"));
        Ok(())
    }

    fn headers(lines: &[&str]) -> RequestHeaders {
        let mut headers = RequestHeaders::new(1024).expect("limit");
        for line in lines.iter().copied().chain(["\r\n"]) {
            headers.push_line(line).expect("header");
        }
        headers
    }

    #[test]
    fn admit_derives_body_framing() {
        let target = "http://www.nicovideo.jp/api/post";
        let fixed = admit(&Method::POST, target, &headers(&["Content-Length: 12\r\n"]))
            .expect("admitted");
        assert_eq!(fixed.body_plan, BodyPlan::Fixed(12));
        assert!(!fixed.expect_continue);

        let chunked = admit(
            &Method::POST,
            target,
            &headers(&["Transfer-Encoding: chunked\r\n", "Expect: 100-continue\r\n"]),
        )
        .expect("admitted");
        assert_eq!(chunked.body_plan, BodyPlan::Chunked);
        assert!(chunked.expect_continue);

        let empty = admit(&Method::GET, target, &headers(&["Content-Length: 0\r\n"]))
            .expect("admitted");
        assert_eq!(empty.body_plan, BodyPlan::Empty);
    }

    #[test]
    fn admit_names_the_rejection_reason() {
        let plain = headers(&[]);
        let cases = [
            (Method::CONNECT, "www.nicovideo.jp:443", &plain, "connect_unsupported"),
            (Method::GET, "/no-host", &plain, "bad_request"),
        ];
        for (method, target, headers, reason) in cases {
            let rejection = admit(&method, target, headers).err().expect("rejected");
            assert_eq!(rejection.reason, reason);
        }
        let odd = headers(&["Expect: later\r\n"]);
        let rejection = admit(&Method::GET, "http://a/", &odd).err().expect("rejected");
        assert_eq!(rejection.status, StatusCode::EXPECTATION_FAILED);
        assert!(rejection.detail.is_some());
    }
}
