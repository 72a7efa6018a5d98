use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A response read until the proxy closed the connection.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send_raw(addr: SocketAddr, request: impl AsRef<[u8]>) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_ref()).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    timeout(StdDuration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .context("timed out waiting for proxy response")??;
    parse_response(&raw)
}

/// Sends a proxy-style `GET` with an absolute-form target.
pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Result<HttpResponse> {
    let authority = url
        .strip_prefix("http://")
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| anyhow!("expected an http URL: {url}"))?;
    let request = format!(
        "GET {url} HTTP/1.1\r\nHost: {authority}\r\nAccept-Encoding: gzip\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    send_raw(proxy, request).await
}

fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = String::from_utf8(raw[..split].to_vec()).context("invalid UTF-8 response head")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;
    Ok(HttpResponse {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    })
}
