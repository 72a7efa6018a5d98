use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Headers scoped to a single connection. They are consumed by the proxy and never relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

pub fn is_hop_by_hop(lower_name: &str) -> bool {
    HOP_BY_HOP.contains(&lower_name)
}

/// One header as it appeared on the wire, plus its lowercase name for matching.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
    key: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.to_ascii_lowercase(),
            value: value.into(),
            name,
        }
    }

    /// Splits a `Name: value` line. The line terminator must already be removed.
    pub fn parse(line: &str) -> Result<Self> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        ensure!(!name.is_empty(), "header name must not be empty");
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        Ok(Self::new(name, value.trim()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

pub fn fields_to_map<'a>(fields: impl IntoIterator<Item = &'a HeaderField>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for field in fields {
        if let Ok(name) = HeaderName::from_bytes(field.name.as_bytes())
            && let Ok(value) = HeaderValue::from_str(&field.value)
        {
            map.append(name, value);
        }
    }
    map
}

/// Header names listed by every `Connection` header of a message, lowercased.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTokens(HashSet<String>);

impl ConnectionTokens {
    pub fn absorb(&mut self, value: &str) {
        self.0.extend(
            value
                .split(',')
                .map(|token| token.trim().to_ascii_lowercase())
                .filter(|token| !token.is_empty()),
        );
    }

    pub fn contains(&self, lower_name: &str) -> bool {
        self.0.contains(lower_name)
    }

    /// True when `field` must not travel past this hop.
    pub fn excludes(&self, field: &HeaderField) -> bool {
        is_hop_by_hop(field.key()) || self.contains(field.key())
    }
}

impl<'a> FromIterator<&'a HeaderField> for ConnectionTokens {
    fn from_iter<I: IntoIterator<Item = &'a HeaderField>>(fields: I) -> Self {
        let mut tokens = Self::default();
        for field in fields {
            if field.key() == "connection" {
                tokens.absorb(&field.value);
            }
        }
        tokens
    }
}

/// Parses a `Content-Length` value into `slot`. A second occurrence is rejected.
pub fn record_content_length(slot: &mut Option<u64>, value: &str) -> Result<()> {
    if slot.is_some() {
        bail!("multiple Content-Length headers are not supported");
    }
    let length = value
        .parse()
        .with_context(|| format!("invalid Content-Length value '{value}'"))?;
    *slot = Some(length);
    Ok(())
}

/// Running byte count for one message head.
pub struct HeaderBudget {
    limit: usize,
    used: usize,
    exceeded: &'static str,
}

impl HeaderBudget {
    pub fn new(limit: usize, exceeded: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            exceeded,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self.used.saturating_add(bytes);
        ensure!(self.used <= self.limit, "{}", self.exceeded);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }
}
