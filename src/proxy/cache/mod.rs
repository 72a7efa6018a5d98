use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use tokio::fs as async_fs;
use tracing::{debug, info, trace, warn};

mod admission;
mod key;
mod lookup;
mod maintenance;
mod matcher;
mod store;
mod tap;
mod title;
mod writer;

pub use admission::CacheSkipReason;
use admission::{StoreCandidate, VideoStorePlan, plan_video_store};
pub use key::{
    ENTRY_PREFIX, EntryPattern, ParsedEntryName, QualityTier, SECONDARY_MARKER, VideoKey,
    encode_file_name, parse_file_name,
};
pub use lookup::{CacheLookupOutcome, CachedVideo};
use maintenance::prepare_cache_root;
pub use matcher::{extract_title, is_html, parse_video_subtype, parse_video_url, parse_watch_url};
use store::CacheStore;
pub use tap::{ResponseTap, TapOutcome, TitleScanner};
pub use title::{TITLE_STORE_CAPACITY, TitleStore, sanitize_title};
use writer::{ClaimSet, WriteClaim};
pub use writer::{CacheWriter, StoredEntry, WriteCompletion};

/// Header set on every response served from disk.
pub const CACHE_MARKER_HEADER: &str = "x-nicocache";
pub const CACHE_MARKER_VALUE: &str = "hit";
pub const SERVER_NAME: &str = concat!("nicocache/", env!("CARGO_PKG_VERSION"));
/// `Server` values emitted by any release when serving a hit, including the ones that predate
/// the marker header.
pub(crate) const LEGACY_SERVER_PREFIXES: [&str; 2] = ["NicoCacheNor/", "nicocache/"];

/// Result of offering one video response to the cache.
#[derive(Debug)]
pub enum StoreOutcome {
    Skipped(CacheSkipReason),
    Stored(StoredEntry),
    Failed,
}

impl StoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOutcome::Skipped(reason) => reason.as_str(),
            StoreOutcome::Stored(_) => "stored",
            StoreOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct VideoCache {
    state: Arc<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    store: CacheStore,
    titles: TitleStore,
    claims: ClaimSet,
    max_title_scan_bytes: usize,
}

impl VideoCache {
    /// Opens the cache rooted at `root`, creating it if needed and discarding partial writes
    /// from an earlier run.
    pub async fn new(root: PathBuf, max_title_scan_bytes: usize) -> Result<Self> {
        let store = CacheStore::new(root);
        prepare_cache_root(&store).await?;
        Ok(Self {
            state: Arc::new(CacheState {
                store,
                titles: TitleStore::new(),
                claims: ClaimSet::default(),
                max_title_scan_bytes,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        self.state.store.root()
    }

    pub fn titles(&self) -> &TitleStore {
        &self.state.titles
    }

    pub fn record_title(&self, id: &str, raw_title: &str) -> String {
        let (title, evicted) = self.state.titles.put(id, raw_title);
        if let Some(evicted) = evicted {
            trace!(video_id = %evicted, "title evicted");
        }
        crate::metrics::record_title_recorded();
        info!(video_id = %id, title = %title, "recorded video title");
        title
    }

    /// Picks what to do with an upstream response body before any of it is relayed.
    pub async fn tap_response(
        &self,
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> ResponseTap {
        if let Some(id) = parse_watch_url(url) {
            let html = headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(is_html);
            if status == StatusCode::OK && html {
                return ResponseTap::Title(TitleScanner::new(id, self.state.max_title_scan_bytes));
            }
            return ResponseTap::Pass;
        }

        match plan_video_store(url, status, headers) {
            VideoStorePlan::Ignore => ResponseTap::Pass,
            VideoStorePlan::Skip(key, reason) => {
                record_skip(&key, reason);
                ResponseTap::Skip(reason)
            }
            VideoStorePlan::Store(candidate) => match self.begin_store(candidate).await {
                Ok(Ok(writer)) => ResponseTap::Store(writer),
                Ok(Err((key, reason))) => {
                    record_skip(&key, reason);
                    ResponseTap::Skip(reason)
                }
                Err(err) => {
                    warn!(error = %err, "failed to open cache file");
                    crate::metrics::record_cache_store_error();
                    ResponseTap::Failed
                }
            },
        }
    }

    async fn begin_store(
        &self,
        candidate: StoreCandidate,
    ) -> Result<std::result::Result<CacheWriter, (VideoKey, CacheSkipReason)>> {
        let StoreCandidate { key, extension } = candidate;
        let Some(claim) = WriteClaim::try_acquire(&self.state.claims, &key) else {
            return Ok(Err((key, CacheSkipReason::WriteInProgress)));
        };

        let existing = self
            .state
            .store
            .find_matching_async(EntryPattern::new(key.clone()))
            .await?;
        if !existing.is_empty() {
            return Ok(Err((key, CacheSkipReason::AlreadyCached)));
        }

        let title = self.state.titles.get(&key.id);
        let final_path = self
            .state
            .store
            .entry_path(&key.file_name(&title, &extension));
        let temp_path = self.state.store.temp_path();

        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o644);
        }
        let file = options.open(&temp_path).await?;

        info!(path = %final_path.display(), "storing video");
        Ok(Ok(CacheWriter::new(
            file,
            temp_path,
            final_path,
            key,
            self.state.store.clone(),
            claim,
        )))
    }

    /// Publishes or discards a finished body and runs the follow-up work for a publish.
    pub async fn complete_store(&self, writer: CacheWriter, transfer_ok: bool) -> StoreOutcome {
        let key = writer.key().clone();
        let completion = if transfer_ok {
            match writer.finish().await {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(error = %err, key = %key, "failed to publish cache entry");
                    crate::metrics::record_cache_store_error();
                    return StoreOutcome::Failed;
                }
            }
        } else {
            writer.abandon().await
        };

        self.on_write_complete(&completion).await;

        match completion {
            WriteCompletion::Published(entry) => {
                crate::metrics::record_cache_store();
                info!(path = %entry.path.display(), bytes = entry.size, "stored video");
                StoreOutcome::Stored(entry)
            }
            WriteCompletion::Superseded { key, existing } => {
                debug!(key = %key, existing = %existing.display(), "entry appeared during write");
                record_skip(&key, CacheSkipReason::AlreadyCached);
                StoreOutcome::Skipped(CacheSkipReason::AlreadyCached)
            }
            WriteCompletion::Abandoned { key } => {
                debug!(key = %key, "transfer incomplete; discarded partial cache file");
                crate::metrics::record_cache_store_error();
                StoreOutcome::Failed
            }
        }
    }

    /// A published primary entry makes every secondary entry for the same id redundant.
    pub async fn on_write_complete(&self, completion: &WriteCompletion) -> usize {
        match completion {
            WriteCompletion::Published(entry) if entry.key.tier == QualityTier::Primary => {
                self.invalidate_secondary(&entry.key.id).await
            }
            _ => 0,
        }
    }

    /// Deletes all secondary entries for `id`, returning how many were removed.
    pub async fn invalidate_secondary(&self, id: &str) -> usize {
        let pattern = EntryPattern::new(VideoKey::secondary(id));
        let candidates = match self.state.store.find_matching_async(pattern).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, video_id = %id, "failed to scan for secondary entries");
                return 0;
            }
        };

        let mut removed = 0;
        for path in candidates {
            match async_fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = %path.display(), "deleted secondary cache entry");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to delete cache entry");
                }
            }
        }
        crate::metrics::record_cache_invalidation(removed as u64);
        removed
    }

    /// Offers a fully buffered response to the cache.
    pub async fn store(
        &self,
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> StoreOutcome {
        let mut tap = self.tap_response(url, status, headers).await;
        tap.observe(body).await;
        match tap.complete(self, true).await {
            TapOutcome::Store(outcome) => outcome,
            TapOutcome::Passed | TapOutcome::Title(_) => {
                StoreOutcome::Skipped(CacheSkipReason::NotVideoUrl)
            }
        }
    }
}

fn record_skip(key: &VideoKey, reason: CacheSkipReason) {
    crate::metrics::record_cache_skip(reason.as_str());
    debug!(key = %key, reason = reason.as_str(), "not caching video response");
}
