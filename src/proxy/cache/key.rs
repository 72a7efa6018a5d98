use std::fmt;

/// Leading token of every cache file name.
pub const ENTRY_PREFIX: &str = "sm";
/// Marker the upstream site appends to reduced-quality stream URLs, reused as the file name
/// suffix for secondary entries.
pub const SECONDARY_MARKER: &str = "low";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QualityTier {
    Primary,
    Secondary,
}

impl QualityTier {
    pub fn suffix(self) -> &'static str {
        match self {
            QualityTier::Primary => "",
            QualityTier::Secondary => SECONDARY_MARKER,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Primary => "primary",
            QualityTier::Secondary => "secondary",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of one cached representation: the numeric video id plus its tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoKey {
    pub id: String,
    pub tier: QualityTier,
}

impl VideoKey {
    pub fn new(id: impl Into<String>, tier: QualityTier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }

    pub fn primary(id: impl Into<String>) -> Self {
        Self::new(id, QualityTier::Primary)
    }

    pub fn secondary(id: impl Into<String>) -> Self {
        Self::new(id, QualityTier::Secondary)
    }

    pub fn with_tier(&self, tier: QualityTier) -> Self {
        Self::new(self.id.clone(), tier)
    }

    pub fn file_name(&self, title: &str, extension: &str) -> String {
        encode_file_name(self, title, extension)
    }
}

impl fmt::Display for VideoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", ENTRY_PREFIX, self.id, self.tier.suffix())
    }
}

/// Longest file name most filesystems accept, in bytes.
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Builds `sm<id><suffix>-<title>.<ext>`. The title is cut at a char boundary when the whole
/// name would exceed [`MAX_FILE_NAME_BYTES`].
pub fn encode_file_name(key: &VideoKey, title: &str, extension: &str) -> String {
    let head = format!("{ENTRY_PREFIX}{}{}-", key.id, key.tier.suffix());
    let room = MAX_FILE_NAME_BYTES.saturating_sub(head.len() + 1 + extension.len());
    format!("{head}{}.{extension}", truncate_at_char_boundary(title, room))
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let end = text
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|&index| index <= max_bytes)
        .last()
        .unwrap_or(0);
    &text[..end]
}

/// Fields recovered from a cache file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntryName {
    pub key: VideoKey,
    pub title: String,
    pub extension: String,
}

/// Decodes a cache file name. The id is the whole run of digits after the prefix, so a name
/// only ever maps to one key; anything else (temp files, user notes) yields `None`.
pub fn parse_file_name(name: &str) -> Option<ParsedEntryName> {
    let rest = name.strip_prefix(ENTRY_PREFIX)?;
    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let (id, rest) = rest.split_at(digits);

    let (tier, rest) = if let Some(rest) = rest.strip_prefix(SECONDARY_MARKER) {
        (QualityTier::Secondary, rest)
    } else {
        (QualityTier::Primary, rest)
    };
    let rest = rest.strip_prefix('-')?;

    let (title, extension) = rest.rsplit_once('.')?;
    if extension.is_empty() {
        return None;
    }

    Some(ParsedEntryName {
        key: VideoKey::new(id, tier),
        title: title.to_string(),
        extension: extension.to_string(),
    })
}

/// Name predicate selecting completed entries of exactly one `(id, tier)`, whatever their
/// title or extension.
#[derive(Debug, Clone)]
pub struct EntryPattern {
    key: VideoKey,
}

impl EntryPattern {
    pub fn new(key: VideoKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &VideoKey {
        &self.key
    }

    pub fn matches(&self, file_name: &str) -> bool {
        parse_file_name(file_name)
            .map(|parsed| parsed.key == self.key)
            .unwrap_or(false)
    }
}
