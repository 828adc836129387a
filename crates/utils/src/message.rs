//! Outgoing message representation used by the signing pipeline.
//!
//! This module defines [`OutgoingMessage`], an in-flight email with its SMTP
//! envelope, its parsed [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322)
//! headers and the raw bytes that will eventually be delivered.

use std::collections::HashSet;

use uuid::Uuid;

use crate::parse_raw_headers;

/// Represents an email message on its way out of the mail pipeline.
///
/// Headers are parsed once on construction and kept as an ordered `Vec`
/// (preserving RFC 5322 order and duplicate headers). The raw bytes are
/// treated as opaque, a transformer replacing them (e.g. with a signed
/// structure) keeps the original bytes available through
/// [`original_raw`](Self::original_raw).
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Unique identifier used to correlate log lines for this message.
    pub message_id: String,

    /// Envelope sender address (`MAIL FROM`).
    pub from: String,

    /// Set of envelope recipient addresses.
    pub rcpts: HashSet<String>,

    /// Ordered list of headers of the original message (case-preserved keys,
    /// trimmed and unfolded values).
    headers: Vec<(String, String)>,

    /// Current raw message (headers + blank line + body).
    raw: Vec<u8>,

    /// Raw message as received, never modified after construction.
    original_raw: Vec<u8>,

    /// Whether the raw message was replaced by a signed structure.
    signed: bool,
}

impl OutgoingMessage {
    pub fn new(from: String, rcpts: HashSet<String>, raw: Vec<u8>) -> Self {
        let (headers, _) = parse_raw_headers(&raw);
        Self {
            message_id: Uuid::new_v4().to_string(),
            from,
            rcpts,
            headers,
            raw: raw.clone(),
            original_raw: raw,
            signed: false,
        }
    }

    pub fn from_raw(from: &str, rcpt: &str, raw: &[u8]) -> Self {
        Self::new(
            from.to_string(),
            HashSet::from([rcpt.to_string()]),
            raw.to_vec(),
        )
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the current raw message bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the raw message as received, before any transformer modifications.
    pub fn original_raw(&self) -> &[u8] {
        &self.original_raw
    }

    /// Returns whether the message was replaced by a signed structure.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Replaces the raw message with its signed form.
    ///
    /// The parsed [`headers`](Self::headers) keep describing the original
    /// message, as the signed structure wraps it as a whole.
    pub fn replace_signed(&mut self, signed: Vec<u8>) {
        self.raw = signed;
        self.signed = true;
    }

    /// Consumes the message, returning the raw bytes to be delivered.
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}
