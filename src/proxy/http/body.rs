use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    proxy::cache::ResponseTap,
    proxy::http::codec::{ResponseBodyPlan, read_line_with_timeout},
    util::timeout_with_context,
};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const BUFFER_SIZE: usize = 8192;

/// Request body framing as announced by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

/// Read/write deadlines for one direction of a relay.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RelayTimeouts {
    pub read: Duration,
    pub write: Duration,
}

/// Copies the client's request body to the upstream unchanged, framing included.
pub(crate) async fn relay_request_body<S, U>(
    client: &mut BufReader<S>,
    upstream: &mut U,
    plan: BodyPlan,
    timeouts: RelayTimeouts,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut relay = Relay {
        reader: client,
        writer: upstream,
        timeouts,
        peer,
        source: "client",
        tap: None,
        written: 0,
    };
    match plan {
        BodyPlan::Empty => {}
        BodyPlan::Fixed(length) => relay.payload(Some(length)).await?,
        BodyPlan::Chunked => relay.chunked(false).await?,
    }
    Ok(relay.written)
}

/// Relays an upstream response body to the client according to `plan`, handing every decoded
/// payload byte to `tap`. With `dechunk` set, a chunked body reaches the client as raw bytes
/// delimited by connection close. Returns the number of bytes written to the client.
pub(crate) async fn relay_response_body<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    plan: ResponseBodyPlan,
    timeouts: RelayTimeouts,
    peer: SocketAddr,
    tap: &mut ResponseTap,
    dechunk: bool,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut relay = Relay {
        reader: upstream,
        writer: client,
        timeouts,
        peer,
        source: "upstream",
        tap: Some(tap),
        written: 0,
    };
    match plan {
        ResponseBodyPlan::Empty => {}
        ResponseBodyPlan::Fixed(length) => relay.payload(Some(length)).await?,
        ResponseBodyPlan::UntilClose => relay.payload(None).await?,
        ResponseBodyPlan::Chunked => relay.chunked(dechunk).await?,
    }
    Ok(relay.written)
}

struct Relay<'a, R, W> {
    reader: &'a mut BufReader<R>,
    writer: &'a mut W,
    timeouts: RelayTimeouts,
    peer: SocketAddr,
    /// `client` or `upstream`, for error messages.
    source: &'static str,
    tap: Option<&'a mut ResponseTap>,
    written: u64,
}

impl<R, W> Relay<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        timeout_with_context(
            self.timeouts.read,
            self.reader.read(buffer),
            format!("reading body from {} {}", self.source, self.peer),
        )
        .await
    }

    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        timeout_with_context(
            self.timeouts.write,
            self.writer.write_all(bytes),
            format!("relaying body from {}", self.source),
        )
        .await?;
        self.written = self.written.saturating_add(bytes.len() as u64);
        Ok(())
    }

    async fn read_line(&mut self, line: &mut String, what: &str) -> Result<()> {
        line.clear();
        let read = read_line_with_timeout(
            self.reader,
            line,
            self.timeouts.read,
            self.peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        ensure!(read > 0, "{} closed connection inside {what}", self.source);
        Ok(())
    }

    /// Copies payload bytes, `limit` of them or everything up to end of stream.
    async fn payload(&mut self, limit: Option<u64>) -> Result<()> {
        let mut remaining = limit;
        let mut buffer = [0u8; BUFFER_SIZE];
        while remaining != Some(0) {
            let want = remaining.map_or(BUFFER_SIZE, |left| left.min(BUFFER_SIZE as u64) as usize);
            let read = self.read(&mut buffer[..want]).await?;
            if read == 0 {
                match remaining {
                    None => break,
                    Some(left) => bail!(
                        "{} closed connection early with {left} body bytes outstanding",
                        self.source
                    ),
                }
            }
            self.emit(&buffer[..read]).await?;
            if let Some(tap) = self.tap.as_deref_mut() {
                tap.observe(&buffer[..read]).await;
            }
            remaining = remaining.map(|left| left - read as u64);
        }
        Ok(())
    }

    /// Walks a chunked body. Chunk data goes to the tap; framing lines are relayed as received
    /// unless `dechunk` is set.
    async fn chunked(&mut self, dechunk: bool) -> Result<()> {
        let mut line = String::new();
        loop {
            self.read_line(&mut line, "chunk size").await?;
            let size = parse_chunk_size(&line)?;
            if !dechunk {
                self.emit(line.as_bytes()).await?;
            }
            if size == 0 {
                break;
            }
            self.payload(Some(size)).await?;

            let mut crlf = [0u8; 2];
            timeout_with_context(
                self.timeouts.read,
                self.reader.read_exact(&mut crlf),
                format!("reading chunk terminator from {}", self.peer),
            )
            .await?;
            ensure!(&crlf == b"\r\n", "invalid chunk terminator from {}", self.peer);
            if !dechunk {
                self.emit(&crlf).await?;
            }
        }

        // Trailer section, ended by an empty line.
        loop {
            self.read_line(&mut line, "chunk trailer").await?;
            if !dechunk {
                self.emit(line.as_bytes()).await?;
            }
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                return Ok(());
            }
        }
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let line = line.trim_end_matches(['\r', '\n']);
    let digits = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid chunk size '{digits}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cache::TitleScanner;

    const PEER: &str = "127.0.0.1:80";

    fn timeouts() -> RelayTimeouts {
        RelayTimeouts {
            read: Duration::from_secs(1),
            write: Duration::from_secs(1),
        }
    }

    fn scanner_tap() -> ResponseTap {
        ResponseTap::Title(TitleScanner::new("9", 1024))
    }

    fn scanned_title(tap: ResponseTap) -> Option<String> {
        match tap {
            ResponseTap::Title(scanner) => scanner.title(),
            _ => panic!("tap changed kind"),
        }
    }

    #[tokio::test]
    async fn chunked_relay_forwards_framing_and_taps_payload() -> Result<()> {
        let raw = b"7\r\n<title>\r\n9;ext=1\r\nClip-Site\r\n8\r\n</title>\r\n0\r\nX-T: 1\r\n\r\n";
        let mut upstream = BufReader::new(&raw[..]);
        let mut client = Vec::new();
        let mut tap = scanner_tap();

        let written = relay_response_body(
            &mut upstream,
            &mut client,
            ResponseBodyPlan::Chunked,
            timeouts(),
            PEER.parse()?,
            &mut tap,
            false,
        )
        .await?;

        assert_eq!(client, raw.to_vec());
        assert_eq!(written, raw.len() as u64);
        assert_eq!(scanned_title(tap).as_deref(), Some("Clip"));
        Ok(())
    }

    #[tokio::test]
    async fn dechunked_relay_writes_payload_only() -> Result<()> {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut upstream = BufReader::new(&raw[..]);
        let mut client = Vec::new();
        let mut tap = ResponseTap::Pass;

        let written = relay_response_body(
            &mut upstream,
            &mut client,
            ResponseBodyPlan::Chunked,
            timeouts(),
            PEER.parse()?,
            &mut tap,
            true,
        )
        .await?;

        assert_eq!(client, b"hello world".to_vec());
        assert_eq!(written, 11);
        Ok(())
    }

    #[tokio::test]
    async fn fixed_relay_fails_on_short_body() -> Result<()> {
        let raw = b"abc";
        let mut upstream = BufReader::new(&raw[..]);
        let mut client = Vec::new();
        let mut tap = ResponseTap::Pass;

        let err = relay_response_body(
            &mut upstream,
            &mut client,
            ResponseBodyPlan::Fixed(10),
            timeouts(),
            PEER.parse()?,
            &mut tap,
            false,
        )
        .await
        .expect_err("short body should fail");
        assert!(err.to_string().contains("closed connection early"));
        assert_eq!(client, b"abc".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn until_close_relays_everything() -> Result<()> {
        let raw = vec![7u8; BUFFER_SIZE * 2 + 17];
        let mut upstream = BufReader::new(&raw[..]);
        let mut client = Vec::new();
        let mut tap = ResponseTap::Pass;

        let written = relay_response_body(
            &mut upstream,
            &mut client,
            ResponseBodyPlan::UntilClose,
            timeouts(),
            PEER.parse()?,
            &mut tap,
            false,
        )
        .await?;
        assert_eq!(written, raw.len() as u64);
        assert_eq!(client, raw);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_bad_chunk_terminator() -> Result<()> {
        let raw = b"3\r\nabcXX0\r\n\r\n";
        let mut upstream = BufReader::new(&raw[..]);
        let mut sink = Vec::new();
        let err = relay_request_body(
            &mut upstream,
            &mut sink,
            BodyPlan::Chunked,
            timeouts(),
            PEER.parse()?,
        )
        .await
        .expect_err("bad terminator");
        assert!(err.to_string().contains("invalid chunk terminator"));
        Ok(())
    }

    #[tokio::test]
    async fn fixed_request_body_is_copied() -> Result<()> {
        let raw = b"name=value&rest";
        let mut reader = BufReader::new(&raw[..]);
        let mut upstream = Vec::new();
        let copied = relay_request_body(
            &mut reader,
            &mut upstream,
            BodyPlan::Fixed(10),
            timeouts(),
            PEER.parse()?,
        )
        .await?;
        assert_eq!(copied, 10);
        assert_eq!(upstream, b"name=value".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn chunked_request_body_keeps_its_framing() -> Result<()> {
        let raw = b"4\r\nsm12\r\n0\r\nX-Check: 1\r\n\r\nnext request";
        let mut reader = BufReader::new(&raw[..]);
        let mut upstream = Vec::new();
        let copied = relay_request_body(
            &mut reader,
            &mut upstream,
            BodyPlan::Chunked,
            timeouts(),
            PEER.parse()?,
        )
        .await?;
        let expected = b"4\r\nsm12\r\n0\r\nX-Check: 1\r\n\r\n";
        assert_eq!(upstream, expected.to_vec());
        assert_eq!(copied, expected.len() as u64);
        Ok(())
    }

    #[test]
    fn chunk_size_ignores_extensions() -> Result<()> {
        assert_eq!(parse_chunk_size("1a;name=value\r\n")?, 26);
        assert_eq!(parse_chunk_size("0\r\n")?, 0);
        assert!(parse_chunk_size("zz\r\n").is_err());
        Ok(())
    }
}
