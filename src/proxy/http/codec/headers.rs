use anyhow::{Result, bail, ensure};

use crate::proxy::headers::{ConnectionTokens, HeaderBudget, HeaderField, record_content_length};

/// Header section of a client request. Framing and routing headers are interpreted here and
/// kept out of [`RequestHeaders::forward_headers`].
pub(crate) struct RequestHeaders {
    budget: HeaderBudget,
    fields: Vec<HeaderField>,
    connection: ConnectionTokens,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
}

impl RequestHeaders {
    pub fn new(max_bytes: usize) -> Result<Self> {
        Ok(Self {
            budget: HeaderBudget::new(max_bytes, "request headers exceed configured limit")?,
            fields: Vec::new(),
            connection: ConnectionTokens::default(),
            host: None,
            content_length: None,
            chunked: false,
        })
    }

    /// Takes one raw line, terminator included. Returns `false` once the blank line ending the
    /// section has been seen.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.budget.record(line.len())?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(false);
        }
        let field = HeaderField::parse(line)?;
        match field.key() {
            "host" => {
                ensure!(self.host.is_none(), "duplicate Host header");
                ensure!(!field.value.is_empty(), "Host header must not be empty");
                self.host = Some(field.value.to_ascii_lowercase());
            }
            "content-length" => {
                ensure!(
                    !self.chunked,
                    "request must not include both Content-Length and Transfer-Encoding"
                );
                record_content_length(&mut self.content_length, &field.value)?;
            }
            "transfer-encoding" => {
                ensure!(!self.chunked, "duplicate Transfer-Encoding header");
                if !field.value.trim().eq_ignore_ascii_case("chunked") {
                    bail!("unsupported Transfer-Encoding '{}'", field.value);
                }
                ensure!(
                    self.content_length.is_none(),
                    "request must not include both Content-Length and Transfer-Encoding"
                );
                self.chunked = true;
            }
            "connection" => self.connection.absorb(&field.value),
            _ => self.fields.push(field),
        }
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn total_bytes(&self) -> usize {
        self.budget.used()
    }

    /// End-to-end headers in arrival order.
    pub fn forward_headers(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields
            .iter()
            .filter(|field| !self.connection.excludes(field))
    }

    /// Whether the client asked for `100 Continue`. Any other expectation is refused.
    pub fn expect_continue(&self) -> Result<bool> {
        let mut expectations = self.fields.iter().filter(|field| field.key() == "expect");
        let Some(first) = expectations.next() else {
            return Ok(false);
        };
        ensure!(
            expectations.next().is_none(),
            "multiple Expect headers are not supported"
        );
        if !first.value.eq_ignore_ascii_case("100-continue") {
            bail!("unsupported Expect header value '{}'", first.value);
        }
        Ok(true)
    }
}
