use std::time::Duration;

use anyhow::{Result, bail};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::proxy::cache::CachedVideo;
use crate::util::timeout_with_context;

use super::codec::encode_local_http1_head;

const FILE_CHUNK_SIZE: usize = 8192;

/// Streams a stored video to the client as a `200 OK` response. Returns the bytes written,
/// head included.
pub(super) async fn serve_cached_video<C>(
    client: &mut C,
    mut video: CachedVideo,
    timeout_dur: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    let head = encode_local_http1_head(StatusCode::OK, &video.response_headers());
    write_all_with_timeout(client, &head, timeout_dur, "writing cached response head").await?;
    let mut written = head.len() as u64;

    let mut remaining = video.content_length;
    let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        let read = timeout_with_context(
            timeout_dur,
            video.file.read(&mut buffer[..want]),
            "reading cached video",
        )
        .await?;
        if read == 0 {
            bail!(
                "cached video {} ended {remaining} bytes early",
                video.path.display()
            );
        }
        write_all_with_timeout(
            client,
            &buffer[..read],
            timeout_dur,
            "writing cached video to client",
        )
        .await?;
        remaining -= read as u64;
        written += read as u64;
    }
    flush_with_timeout(client, timeout_dur, "flushing cached response").await?;
    debug!(video_id = %video.key.id, path = %video.path.display(), "served cached video");
    Ok(written)
}
