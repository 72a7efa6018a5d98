use once_cell::sync::Lazy;
use regex::Regex;

use super::key::{QualityTier, VideoKey};

// http://smile-{xxxxx}.nicovideo.jp/smile?v={id}.{rand}[low]
static VIDEO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/smile\?\w+=([0-9]+)\.[0-9]+(low)?").expect("video url pattern")
});

static WATCH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/watch/[a-z]{2}([0-9]+)").expect("watch url pattern"));

static VIDEO_CONTENT_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"video/([^;\s/\\]+)").expect("video content type pattern"));

static PAGE_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:title|TITLE)>(.*)-.*</(?:title|TITLE)>").expect("page title pattern")
});

/// Extracts the video key from a stream URL. Only the path and query shape matter; the host is
/// ignored.
pub fn parse_video_url(url: &str) -> Option<VideoKey> {
    let captures = VIDEO_URL.captures(url)?;
    let id = captures.get(1)?.as_str();
    let tier = if captures.get(2).is_some() {
        QualityTier::Secondary
    } else {
        QualityTier::Primary
    };
    Some(VideoKey::new(id, tier))
}

/// Extracts the numeric video id from a watch page URL such as `/watch/sm500`.
pub fn parse_watch_url(url: &str) -> Option<&str> {
    WATCH_URL
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

/// Returns the media subtype of a `video/*` content type, used as the file extension.
pub fn parse_video_subtype(content_type: &str) -> Option<&str> {
    VIDEO_CONTENT_TYPE
        .captures(content_type)
        .and_then(|captures| captures.get(1))
        .map(|subtype| subtype.as_str())
}

pub fn is_html(content_type: &str) -> bool {
    content_type.contains("html")
}

/// Pulls the display title out of a watch page. The site decorates titles as
/// `<title>NAME - SITE</title>`; everything from the last hyphen on is dropped.
pub fn extract_title(html: &str) -> Option<String> {
    let captures = PAGE_TITLE.captures(html)?;
    let title = captures.get(1)?.as_str().trim();
    Some(title.to_string())
}
