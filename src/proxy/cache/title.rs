use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub const TITLE_STORE_CAPACITY: NonZeroUsize = NonZeroUsize::new(20).unwrap();

const FORBIDDEN_TITLE_CHARS: [char; 11] = ['"', '<', '>', '|', '\0', ':', '*', '?', '\\', '&', '/'];

/// Strips characters that cannot appear in file names on common filesystems.
pub fn sanitize_title(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|ch| !FORBIDDEN_TITLE_CHARS.contains(ch))
        .collect();
    cleaned.trim().to_string()
}

/// Bounded video id -> title table. Entries are evicted in insertion order: reads use `peek`
/// and updates of an existing id happen in place, so nothing ever refreshes an entry's
/// position in the underlying LRU list.
#[derive(Debug)]
pub struct TitleStore {
    entries: Mutex<LruCache<String, String>>,
}

impl Default for TitleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleStore {
    pub fn new() -> Self {
        Self::with_capacity(TITLE_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records a title, returning the sanitized value and the id evicted to make room, if any.
    pub fn put(&self, id: &str, raw_title: &str) -> (String, Option<String>) {
        let title = sanitize_title(raw_title);
        let mut guard = self.entries.lock();
        if let Some(existing) = guard.peek_mut(id) {
            existing.clone_from(&title);
            return (title, None);
        }
        let evicted = guard
            .push(id.to_string(), title.clone())
            .map(|(evicted_id, _)| evicted_id);
        (title, evicted)
    }

    /// Title for `id`, or the empty string when none has been seen.
    pub fn get(&self, id: &str) -> String {
        self.entries.lock().peek(id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sanitize_removes_forbidden_characters() {
        assert_eq!(
            sanitize_title(r#"a"b<c>d|e:f*g?h\i&j/k"#),
            "abcdefghijk"
        );
        assert_eq!(sanitize_title("nul\0byte"), "nulbyte");
        assert_eq!(sanitize_title("  padded  "), "padded");
    }

    #[test]
    fn missing_title_is_empty() {
        let store = TitleStore::new();
        assert_eq!(store.get("500"), "");
        assert!(store.is_empty());
    }

    #[test]
    fn put_then_get_returns_sanitized_title() {
        let store = TitleStore::new();
        let (stored, evicted) = store.put("500", "What? Really: yes");
        assert_eq!(stored, "What Really yes");
        assert!(evicted.is_none());
        assert_eq!(store.get("500"), "What Really yes");
    }

    #[test]
    fn twenty_first_key_evicts_oldest_inserted() {
        let store = TitleStore::new();
        for id in 0..20 {
            store.put(&id.to_string(), "title");
        }
        // Reads and in-place updates must not refresh insertion order.
        assert_eq!(store.get("0"), "title");
        store.put("0", "renamed");

        let (_, evicted) = store.put("20", "title");
        assert_eq!(evicted.as_deref(), Some("0"));
        assert_eq!(store.len(), 20);
        assert!(!store.contains("0"));
        assert!(store.contains("1"));
        assert!(store.contains("20"));

        let (_, evicted) = store.put("21", "title");
        assert_eq!(evicted.as_deref(), Some("1"));
        assert_eq!(store.len(), 20);
    }

    #[test]
    fn concurrent_puts_never_exceed_capacity() {
        let store = Arc::new(TitleStore::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("{worker}{i}");
                        store.put(&id, &format!("title {id}"));
                        let _ = store.get(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(store.len(), TITLE_STORE_CAPACITY.get());
    }
}
