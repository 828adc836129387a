/// Parses the header section of a raw email, returning an ordered list of
/// headers and the byte offset at which the content starts.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values, supporting duplicate headers (e.g. `Received`).
/// Folded header lines (RFC 5322 section 2.2.3) are unfolded into the
/// previous header value. The content itself is never decoded, so the
/// input may contain arbitrary bytes after the blank-line separator.
///
/// # Examples
///
/// ```rust
/// let raw = b"From: Alice\r\n <alice@example.com>\r\nTo: bob@example.com\r\n\r\nHello!";
/// let (headers, offset) = smimegate_utils::parse_raw_headers(raw);
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "Alice <alice@example.com>".to_string()));
/// assert_eq!(&raw[offset..], b"Hello!");
/// ```
pub fn parse_raw_headers(raw: &[u8]) -> (Vec<(String, String)>, usize) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    while pos < raw.len() {
        let (line, consumed) = match raw[pos..].iter().position(|&b| b == b'\n') {
            Some(index) => (&raw[pos..pos + index], pos + index + 1),
            None => (&raw[pos..], raw.len()),
        };
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        let text = String::from_utf8_lossy(line);

        if text.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            match headers.last_mut() {
                Some((_, value)) => {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(text.trim());
                }
                // A continuation with nothing to continue is content
                None => break,
            }
        } else if let Some((key, value)) = text.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, pos)
}

/// Extracts the mailbox address from a free-form address header value.
///
/// When the value contains an angle-bracket delimited address the first
/// non-empty `<...>` group is returned, otherwise the whole trimmed value
/// is taken as the address. Later bracket groups (e.g. in group syntax or
/// address lists) are ignored.
///
/// # Examples
///
/// ```rust
/// assert_eq!(smimegate_utils::extract_address("Alice <alice@example.com>"), "alice@example.com");
/// assert_eq!(smimegate_utils::extract_address("  bob@example.com "), "bob@example.com");
/// assert_eq!(smimegate_utils::extract_address("<a@x.org>, <b@y.org>"), "a@x.org");
/// ```
pub fn extract_address(value: &str) -> &str {
    let mut rest = value;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(0) => rest = &after[1..],
            Some(close) => return &after[..close],
            None => break,
        }
    }
    value.trim()
}

/// Normalizes an address for comparison, trimming surrounding whitespace
/// and lowercasing it.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
