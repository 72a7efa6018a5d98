use http::header::{CONTENT_TYPE, SERVER};
use http::{HeaderMap, StatusCode};

use super::key::VideoKey;
use super::matcher::{parse_video_subtype, parse_video_url};
use super::{CACHE_MARKER_HEADER, LEGACY_SERVER_PREFIXES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSkipReason {
    NotVideoUrl,
    ServedFromCache,
    NotSuccess,
    NotVideoContent,
    AlreadyCached,
    WriteInProgress,
}

impl CacheSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSkipReason::NotVideoUrl => "not_video_url",
            CacheSkipReason::ServedFromCache => "served_from_cache",
            CacheSkipReason::NotSuccess => "not_success",
            CacheSkipReason::NotVideoContent => "not_video_content",
            CacheSkipReason::AlreadyCached => "already_cached",
            CacheSkipReason::WriteInProgress => "write_in_progress",
        }
    }
}

#[derive(Debug)]
pub(crate) enum VideoStorePlan {
    /// The URL is not a video stream; nothing to do.
    Ignore,
    Skip(VideoKey, CacheSkipReason),
    Store(StoreCandidate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoreCandidate {
    pub key: VideoKey,
    pub extension: String,
}

/// Decides from the response head alone whether a video response may be persisted. Disk state
/// (existing entries, concurrent writers) is checked later by the cache itself.
pub(crate) fn plan_video_store(
    url: &str,
    status: StatusCode,
    headers: &HeaderMap,
) -> VideoStorePlan {
    let Some(key) = parse_video_url(url) else {
        return VideoStorePlan::Ignore;
    };

    if is_served_from_cache(headers) {
        return VideoStorePlan::Skip(key, CacheSkipReason::ServedFromCache);
    }

    if status != StatusCode::OK {
        return VideoStorePlan::Skip(key, CacheSkipReason::NotSuccess);
    }

    let extension = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_video_subtype);
    let Some(extension) = extension else {
        return VideoStorePlan::Skip(key, CacheSkipReason::NotVideoContent);
    };

    VideoStorePlan::Store(StoreCandidate {
        key,
        extension: extension.to_string(),
    })
}

/// True when the response was produced by a cache hit, ours or an older release's.
pub(crate) fn is_served_from_cache(headers: &HeaderMap) -> bool {
    if headers.contains_key(CACHE_MARKER_HEADER) {
        return true;
    }
    headers
        .get_all(SERVER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|server| {
            LEGACY_SERVER_PREFIXES
                .iter()
                .any(|prefix| server.starts_with(prefix))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const PRIMARY_URL: &str = "http://smile-com1.nicovideo.jp/smile?v=500.99";

    fn video_headers(content_type: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    #[test]
    fn stores_successful_video_response() {
        let plan = plan_video_store(PRIMARY_URL, StatusCode::OK, &video_headers("video/mp4"));
        match plan {
            VideoStorePlan::Store(candidate) => {
                assert_eq!(candidate.key, VideoKey::primary("500"));
                assert_eq!(candidate.extension, "mp4");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn ignores_non_video_urls() {
        let plan = plan_video_store(
            "http://www.nicovideo.jp/watch/sm500",
            StatusCode::OK,
            &video_headers("video/mp4"),
        );
        assert!(matches!(plan, VideoStorePlan::Ignore));
    }

    #[test]
    fn skips_non_ok_status() {
        let plan = plan_video_store(
            PRIMARY_URL,
            StatusCode::PARTIAL_CONTENT,
            &video_headers("video/mp4"),
        );
        assert!(matches!(
            plan,
            VideoStorePlan::Skip(_, CacheSkipReason::NotSuccess)
        ));
    }

    #[test]
    fn skips_non_video_content_type() {
        let plan = plan_video_store(PRIMARY_URL, StatusCode::OK, &video_headers("text/html"));
        assert!(matches!(
            plan,
            VideoStorePlan::Skip(_, CacheSkipReason::NotVideoContent)
        ));
        let plan = plan_video_store(PRIMARY_URL, StatusCode::OK, &HeaderMap::new());
        assert!(matches!(
            plan,
            VideoStorePlan::Skip(_, CacheSkipReason::NotVideoContent)
        ));
    }

    #[test]
    fn loop_guard_recognises_marker_and_historical_servers() {
        let mut marked = video_headers("video/mp4");
        marked.insert(CACHE_MARKER_HEADER, HeaderValue::from_static("hit"));
        assert!(matches!(
            plan_video_store(PRIMARY_URL, StatusCode::OK, &marked),
            VideoStorePlan::Skip(_, CacheSkipReason::ServedFromCache)
        ));

        for server in ["NicoCacheNor/0.1", "NicoCacheNor/0.2.0", "nicocache/9.9.9"] {
            let mut headers = video_headers("video/mp4");
            headers.insert(SERVER, HeaderValue::from_static(server));
            assert!(is_served_from_cache(&headers), "{server}");
        }

        let mut upstream = video_headers("video/mp4");
        upstream.insert(SERVER, HeaderValue::from_static("nginx"));
        assert!(!is_served_from_cache(&upstream));
    }
}
