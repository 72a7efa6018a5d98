use tracing::{debug, warn};

use super::admission::CacheSkipReason;
use super::matcher::extract_title;
use super::writer::CacheWriter;
use super::{StoreOutcome, VideoCache};

const CLOSING_TAGS: [&[u8]; 2] = [b"</title>", b"</TITLE>"];

/// Collects the head of a watch page until the title element has been seen.
#[derive(Debug)]
pub struct TitleScanner {
    video_id: String,
    buffer: Vec<u8>,
    limit: usize,
    done: bool,
}

impl TitleScanner {
    pub fn new(video_id: impl Into<String>, limit: usize) -> Self {
        Self {
            video_id: video_id.into(),
            buffer: Vec::new(),
            limit,
            done: false,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        let room = self.limit.saturating_sub(self.buffer.len());
        let take = room.min(chunk.len());
        self.buffer.extend_from_slice(&chunk[..take]);
        if take < chunk.len() || self.buffer.len() >= self.limit || self.has_closing_tag() {
            self.done = true;
        }
    }

    fn has_closing_tag(&self) -> bool {
        CLOSING_TAGS.iter().any(|tag| {
            self.buffer
                .windows(tag.len())
                .any(|window| window == *tag)
        })
    }

    pub fn title(&self) -> Option<String> {
        extract_title(&String::from_utf8_lossy(&self.buffer))
    }
}

/// Per-response consumer of the decoded body, chosen from the response head.
pub enum ResponseTap {
    Pass,
    Skip(CacheSkipReason),
    Title(TitleScanner),
    Store(CacheWriter),
    /// The cache write failed part way; the body keeps flowing to the client.
    Failed,
}

#[derive(Debug)]
pub enum TapOutcome {
    Passed,
    Title(Option<String>),
    Store(StoreOutcome),
}

impl TapOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapOutcome::Passed => "none",
            TapOutcome::Title(Some(_)) => "title",
            TapOutcome::Title(None) => "no_title",
            TapOutcome::Store(outcome) => outcome.as_str(),
        }
    }
}

impl ResponseTap {
    pub async fn observe(&mut self, chunk: &[u8]) {
        match self {
            ResponseTap::Title(scanner) => scanner.push(chunk),
            ResponseTap::Store(writer) => {
                if let Err(err) = writer.append(chunk).await {
                    warn!(
                        error = %err,
                        key = %writer.key(),
                        "cache write failed; continuing without caching"
                    );
                    crate::metrics::record_cache_store_error();
                    *self = ResponseTap::Failed;
                }
            }
            ResponseTap::Pass | ResponseTap::Skip(_) | ResponseTap::Failed => {}
        }
    }

    /// Finalizes the tap once the body has been relayed. `transfer_ok` is false when the
    /// upstream or client side ended before the full body was seen.
    pub async fn complete(self, cache: &VideoCache, transfer_ok: bool) -> TapOutcome {
        match self {
            ResponseTap::Pass => TapOutcome::Passed,
            ResponseTap::Skip(reason) => TapOutcome::Store(StoreOutcome::Skipped(reason)),
            ResponseTap::Failed => TapOutcome::Store(StoreOutcome::Failed),
            ResponseTap::Store(writer) => {
                TapOutcome::Store(cache.complete_store(writer, transfer_ok).await)
            }
            ResponseTap::Title(scanner) => match scanner.title() {
                Some(raw) => {
                    let title = cache.record_title(scanner.video_id(), &raw);
                    TapOutcome::Title(Some(title))
                }
                None => {
                    debug!(video_id = %scanner.video_id(), "no title found in watch page");
                    TapOutcome::Title(None)
                }
            },
        }
    }
}
