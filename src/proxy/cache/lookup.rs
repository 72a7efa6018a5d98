use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use http::{HeaderMap, HeaderValue, Method};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use super::key::{EntryPattern, QualityTier, VideoKey, parse_file_name};
use super::matcher::parse_video_url;
use super::{CACHE_MARKER_HEADER, CACHE_MARKER_VALUE, SERVER_NAME, VideoCache};

/// A cache entry opened and ready to be streamed to the client.
#[derive(Debug)]
pub struct CachedVideo {
    pub key: VideoKey,
    pub path: PathBuf,
    pub file: async_fs::File,
    pub content_length: u64,
    pub content_type: String,
}

impl CachedVideo {
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.content_length));
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        headers.insert(CONTENT_TYPE, content_type);
        headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        headers.insert(
            CACHE_MARKER_HEADER,
            HeaderValue::from_static(CACHE_MARKER_VALUE),
        );
        headers
    }
}

pub enum CacheLookupOutcome {
    /// Not a cacheable request; go to the network without counting a miss.
    Bypass,
    Miss,
    Hit(Box<CachedVideo>),
}

impl CacheLookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookupOutcome::Bypass => "bypass",
            CacheLookupOutcome::Miss => "miss",
            CacheLookupOutcome::Hit(_) => "hit",
        }
    }
}

impl VideoCache {
    /// Finds the best stored entry for a video request: primary first, then secondary when the
    /// request itself asks for the reduced-quality stream.
    pub async fn resolve(&self, method: &Method, url: &str) -> CacheLookupOutcome {
        if method != Method::GET {
            return CacheLookupOutcome::Bypass;
        }
        let Some(requested) = parse_video_url(url) else {
            return CacheLookupOutcome::Bypass;
        };

        let mut tiers = vec![QualityTier::Primary];
        if requested.tier == QualityTier::Secondary {
            tiers.push(QualityTier::Secondary);
        }

        for tier in tiers {
            let key = requested.with_tier(tier);
            if let Some(hit) = self.resolve_tier(&key).await {
                let label = match tier {
                    QualityTier::Primary => "hit_primary",
                    QualityTier::Secondary => "hit_secondary",
                };
                crate::metrics::record_cache_lookup(label);
                info!(path = %hit.path.display(), "serving video from cache");
                return CacheLookupOutcome::Hit(Box::new(hit));
            }
        }

        crate::metrics::record_cache_lookup("miss");
        debug!(key = %requested, "video not cached");
        CacheLookupOutcome::Miss
    }

    async fn resolve_tier(&self, key: &VideoKey) -> Option<CachedVideo> {
        let candidates = match self
            .state
            .store
            .find_matching_async(EntryPattern::new(key.clone()))
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, key = %key, "cache scan failed");
                return None;
            }
        };

        for path in candidates {
            match open_entry(key, &path).await {
                Ok(Some(video)) => return Some(video),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to open cache entry");
                }
            }
        }
        None
    }
}

/// Opens one candidate. `Ok(None)` means it disappeared after the scan.
async fn open_entry(key: &VideoKey, path: &Path) -> Result<Option<CachedVideo>> {
    let Some(extension) = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_file_name)
        .map(|parsed| parsed.extension)
    else {
        return Ok(None);
    };

    let file = match async_fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some(CachedVideo {
        key: key.clone(),
        path: path.to_path_buf(),
        file,
        content_length: metadata.len(),
        content_type: format!("video/{extension}"),
    }))
}
