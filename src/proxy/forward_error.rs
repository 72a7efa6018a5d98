use std::io;
use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;
use tracing::warn;

/// Failures reaching the origin before any response byte was relayed. These still leave room
/// for an error response to the client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream {target}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to upstream {target}")]
    ConnectTimeout { target: String },
    #[error("upstream {target} sent an invalid response head: {detail}")]
    InvalidResponse { target: String, detail: String },
}

impl UpstreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Connect { .. } => "connect",
            UpstreamError::ConnectTimeout { .. } => "connect_timeout",
            UpstreamError::InvalidResponse { .. } => "invalid_response",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::ConnectTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Connect { .. } | UpstreamError::InvalidResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// How the client side should learn about a failed transaction.
pub enum ForwardErrorKind<'a> {
    /// Nothing has been sent yet; answer with an error status.
    Upstream(&'a UpstreamError),
    /// Any other failure. Once the response head is out, the connection is just closed.
    Other,
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    match err.downcast_ref::<UpstreamError>() {
        Some(upstream) => ForwardErrorKind::Upstream(upstream),
        None => ForwardErrorKind::Other,
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, host: &str, err: &Error) {
    match kind {
        ForwardErrorKind::Upstream(upstream) => {
            crate::metrics::record_upstream_error(upstream.kind());
            warn!(
                peer = %peer,
                host,
                kind = upstream.kind(),
                error = %upstream,
                "upstream request failed"
            );
        }
        ForwardErrorKind::Other => {
            crate::metrics::record_upstream_error("transfer");
            warn!(peer = %peer, host, error = %err, "transfer aborted");
        }
    }
}
