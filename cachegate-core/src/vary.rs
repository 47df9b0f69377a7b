//! Vary fingerprint codec (§4.5): build a compressed fingerprint of the header values a stored
//! object's `Vary:` response header names, and match a live request against it.
//!
//! Wire format, terminated by `0xFF 0xFF 0x00`:
//! ```text
//! entry := len_hi:u8  len_lo:u8  name_len:u8  name_bytes...  ':'  0x00  [value_bytes if len != 0xFFFF]
//! ```
//! `len == 0xFFFF` means "header not present in this request".
use std::borrow::Cow;

const TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0x00];
const ABSENT: u16 = 0xFFFF;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum VaryError {
    #[error("header name {0:?} exceeds 127 bytes")]
    NameTooLong(String),
    #[error("header value for {0:?} exceeds 65534 bytes")]
    ValueTooLong(String),
    #[error("malformed vary fingerprint")]
    Malformed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VaryEntry {
    pub name: String,
    /// `None` means the header was absent from the request this entry was built from.
    pub value: Option<String>,
}

/// Build the fingerprint for `vary_header` (the object's `Vary:` response header value, comma
/// separated) by looking up each named header in the live request via `lookup`.
pub fn build<'a>(
    vary_header: &str,
    mut lookup: impl FnMut(&str) -> Option<Cow<'a, str>>,
) -> Result<Vec<VaryEntry>, VaryError> {
    let mut entries = Vec::new();
    for raw_name in vary_header.split(',') {
        let name = raw_name.trim();
        if name.is_empty() {
            continue;
        }
        if name.len() > 127 {
            return Err(VaryError::NameTooLong(name.to_string()));
        }
        let value = lookup(name).map(|v| v.trim_end().to_string());
        if let Some(v) = &value {
            if v.len() >= ABSENT as usize {
                return Err(VaryError::ValueTooLong(name.to_string()));
            }
        }
        entries.push(VaryEntry {
            name: name.to_string(),
            value,
        });
    }
    Ok(entries)
}

#[must_use]
pub fn encode(entries: &[VaryEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        let len: u16 = e.value.as_ref().map_or(ABSENT, |v| v.len() as u16);
        out.extend_from_slice(&len.to_be_bytes());
        out.push((e.name.len() + 1) as u8);
        out.extend_from_slice(e.name.as_bytes());
        out.push(b':');
        out.push(0);
        if let Some(v) = &e.value {
            out.extend_from_slice(v.as_bytes());
        }
    }
    out.extend_from_slice(&TERMINATOR);
    out
}

pub fn decode(buf: &[u8]) -> Result<Vec<VaryEntry>, VaryError> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    loop {
        if buf.len() < cursor + 3 {
            return Err(VaryError::Malformed);
        }
        let len = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
        let name_len_field = buf[cursor + 2];
        if len == ABSENT && name_len_field == 0 {
            // terminator
            return Ok(entries);
        }
        if name_len_field == 0 {
            return Err(VaryError::Malformed);
        }
        let name_len = (name_len_field - 1) as usize;
        let name_start = cursor + 3;
        let colon_at = name_start + name_len;
        if buf.len() <= colon_at + 1 || buf[colon_at] != b':' || buf[colon_at + 1] != 0 {
            return Err(VaryError::Malformed);
        }
        let name = std::str::from_utf8(&buf[name_start..colon_at])
            .map_err(|_| VaryError::Malformed)?
            .to_string();
        let mut next = colon_at + 2;
        let value = if len == ABSENT {
            None
        } else {
            let end = next + len as usize;
            if buf.len() < end {
                return Err(VaryError::Malformed);
            }
            let v = std::str::from_utf8(&buf[next..end])
                .map_err(|_| VaryError::Malformed)?
                .to_string();
            next = end;
            Some(v)
        };
        entries.push(VaryEntry { name, value });
        cursor = next;
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum MatchResult {
    Same,
    Miss,
}

/// Match a stored fingerprint against a live request. `gzip_support` implements the special case
/// from §4.5: when `http_gzip_support` is on, `Accept-Encoding` entries always compare equal,
/// because the cache only ever stores the gzipped representation.
pub fn matches<'a>(
    stored: &[VaryEntry],
    mut lookup: impl FnMut(&str) -> Option<Cow<'a, str>>,
    gzip_support: bool,
) -> MatchResult {
    for entry in stored {
        if gzip_support && entry.name.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        let live = lookup(&entry.name).map(|v| v.trim_end().to_string());
        if live != entry.value {
            return MatchResult::Miss;
        }
    }
    MatchResult::Same
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encode_decode() {
        let entries = vec![
            VaryEntry { name: "Accept-Encoding".into(), value: Some("gzip".into()) },
            VaryEntry { name: "Cookie".into(), value: None },
        ];
        let buf = encode(&entries);
        let decoded = decode(&buf).unwrap();
        assert_eq!(entries, decoded);
        // P4: encode(decode(buf)) == buf
        assert_eq!(encode(&decoded), buf);
    }

    #[test]
    fn build_from_vary_header() {
        let entries = build("Accept-Encoding, Cookie", |name| match name {
            "Accept-Encoding" => Some(Cow::Borrowed("gzip")),
            _ => None,
        })
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value.as_deref(), Some("gzip"));
        assert_eq!(entries[1].value, None);
    }

    #[test]
    fn gzip_support_ignores_accept_encoding_mismatch() {
        let stored = vec![VaryEntry { name: "Accept-Encoding".into(), value: Some("gzip".into()) }];
        let result = matches(&stored, |_| Some(Cow::Borrowed("br")), true);
        assert_eq!(result, MatchResult::Same);
        let result = matches(&stored, |_| Some(Cow::Borrowed("br")), false);
        assert_eq!(result, MatchResult::Miss);
    }
}
