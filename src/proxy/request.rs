use std::borrow::Cow;
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::uri::{Authority, PathAndQuery};
use http::{Method, Uri};

use crate::logging::AccessLogBuilder;

pub const HTTP_DEFAULT_PORT: u16 = 80;
const SCHEME: &str = "http";

/// A proxied request after parsing the start line and `Host` header.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    /// Lowercase, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Origin-form path and query, never empty.
    pub path: String,
}

/// Accepts an absolute `http://` URL, or an origin-form path paired with a `Host` header.
pub fn parse_http1_request(
    method: Method,
    target: &str,
    host_header: Option<&str>,
) -> Result<ParsedRequest> {
    let (authority, path) = if target.starts_with('/') {
        let host = host_header.ok_or_else(|| anyhow!("origin-form request without Host header"))?;
        (host.to_string(), target.to_string())
    } else {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("invalid request target '{target}'"))?;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => {}
            Some(other) => bail!("unsupported scheme '{other}'"),
            None => bail!("request target must be an http URL or start with '/'"),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("request URL has no authority"))?;
        let path = uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .filter(|path| !path.is_empty())
            .unwrap_or("/");
        (authority.to_string(), path.to_string())
    };

    let (host, port) = parse_host_header(&authority)?;
    Ok(ParsedRequest {
        method,
        host,
        port: port.unwrap_or(HTTP_DEFAULT_PORT),
        path,
    })
}

/// Splits a `Host` header or URL authority into a lowercase host and optional port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let value = value.trim();
    ensure!(!value.is_empty(), "empty Host header");
    if let Some(bad) = value
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '@' | '/' | '?' | '#' | '\\'))
    {
        bail!("authority '{value}' contains forbidden character {bad:?}");
    }
    let authority: Authority = value
        .parse()
        .with_context(|| format!("invalid Host header '{value}'"))?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    ensure!(!host.is_empty(), "Host header '{value}' has no hostname");
    Ok((host, authority.port_u16()))
}

impl ParsedRequest {
    pub fn access_log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .url(self.url())
    }

    fn bracketed_host(&self) -> Cow<'_, str> {
        if self.host.contains(':') {
            Cow::Owned(format!("[{}]", self.host))
        } else {
            Cow::Borrowed(&self.host)
        }
    }

    /// `host[:port]` as sent in the upstream `Host` header; the default port is omitted.
    pub fn authority_host(&self) -> String {
        match self.port {
            HTTP_DEFAULT_PORT => self.bracketed_host().into_owned(),
            port => format!("{}:{port}", self.bracketed_host()),
        }
    }

    /// `host:port` for connecting; DNS resolution is left to the socket layer.
    pub fn connect_target(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Absolute URL as seen by the cache matchers.
    pub fn url(&self) -> String {
        format!("{SCHEME}://{}{}", self.authority_host(), self.path)
    }
}
