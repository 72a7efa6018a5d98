use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::key::{EntryPattern, VideoKey};
use super::store::CacheStore;

pub(super) type ClaimSet = Arc<Mutex<HashSet<VideoKey>>>;

/// Exclusive right to publish one `(id, tier)`. Held from the "already cached?" check until
/// the writer is finished or dropped.
#[derive(Debug)]
pub(super) struct WriteClaim {
    claims: ClaimSet,
    key: VideoKey,
}

impl WriteClaim {
    pub(super) fn try_acquire(claims: &ClaimSet, key: &VideoKey) -> Option<Self> {
        let mut guard = claims.lock();
        if !guard.insert(key.clone()) {
            return None;
        }
        Some(Self {
            claims: claims.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for WriteClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.key);
    }
}

/// A published cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: VideoKey,
    pub path: PathBuf,
    pub size: u64,
}

/// How a write ended. Consumed by the cache to run follow-up work such as tier invalidation.
#[derive(Debug)]
pub enum WriteCompletion {
    Published(StoredEntry),
    /// Another entry for the key became visible before the rename.
    Superseded { key: VideoKey, existing: PathBuf },
    /// The transfer did not complete; the temp file was removed.
    Abandoned { key: VideoKey },
}

/// Streams a video body into a temp file inside the cache root and renames it into place
/// once the whole body has arrived. Dropping an unfinished writer deletes the temp file.
pub struct CacheWriter {
    file: AsyncFile,
    staging: PathBuf,
    target: PathBuf,
    key: VideoKey,
    store: CacheStore,
    _claim: WriteClaim,
    received: u64,
    settled: bool,
}

impl CacheWriter {
    pub(super) fn new(
        file: AsyncFile,
        staging: PathBuf,
        target: PathBuf,
        key: VideoKey,
        store: CacheStore,
        claim: WriteClaim,
    ) -> Self {
        Self {
            file,
            staging,
            target,
            key,
            store,
            _claim: claim,
            received: 0,
            settled: false,
        }
    }

    pub fn key(&self) -> &VideoKey {
        &self.key
    }

    pub fn final_path(&self) -> &Path {
        &self.target
    }

    pub fn bytes_written(&self) -> u64 {
        self.received
    }

    pub async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.received += chunk.len() as u64;
        Ok(())
    }

    async fn discard(&mut self) {
        if let Err(err) = async_fs::remove_file(&self.staging).await {
            trace!(path = %self.staging.display(), error = %err, "temp file already gone");
        }
        self.settled = true;
    }

    pub(super) async fn finish(mut self) -> Result<WriteCompletion> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let pattern = EntryPattern::new(self.key.clone());
        if let Some(existing) = self.store.find_matching_async(pattern).await?.into_iter().next() {
            self.discard().await;
            return Ok(WriteCompletion::Superseded {
                key: self.key.clone(),
                existing,
            });
        }

        async_fs::rename(&self.staging, &self.target).await?;
        self.settled = true;
        trace!(path = %self.target.display(), "published cache entry");

        Ok(WriteCompletion::Published(StoredEntry {
            key: self.key.clone(),
            path: self.target.clone(),
            size: self.received,
        }))
    }

    pub(super) async fn abandon(mut self) -> WriteCompletion {
        self.discard().await;
        WriteCompletion::Abandoned {
            key: self.key.clone(),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.settled {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}
