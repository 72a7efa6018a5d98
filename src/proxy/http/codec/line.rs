use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::{Instant, timeout_at};

/// Reads one `\n`-terminated line of at most `max_len` bytes, terminator included, before
/// `deadline`. `Ok(None)` means the peer closed the connection between lines.
pub(super) async fn read_bounded_line<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
    what: &str,
) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "{what} length limit must be greater than zero");
    let mut raw = Vec::new();
    let mut limited = (&mut *reader).take(max_len as u64 + 1);
    let read = timeout_at(deadline, limited.read_until(b'\n', &mut raw))
        .await
        .map_err(|_| anyhow!("timed out reading {what} from {peer}"))??;

    if read == 0 {
        return Ok(None);
    }
    if raw.len() > max_len {
        bail!("{what} exceeds configured limit of {max_len} bytes (peer {peer})");
    }
    if raw.last() != Some(&b'\n') {
        bail!("connection closed while reading {what} from {peer}");
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| anyhow!("{what} from {peer} contained invalid bytes"))
}

/// Fills `buf` with the next line and returns its length; `0` at end of stream.
pub(super) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    if let Some(line) = read_bounded_line(reader, deadline, peer, max_len, "line").await? {
        *buf = line;
    }
    Ok(buf.len())
}

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line_with_deadline(reader, buf, Instant::now() + timeout_dur, peer, max_len).await
}
