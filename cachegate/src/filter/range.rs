//! `range` VDP stage: extract a byte range from a 200 response when the request carried a
//! single-range `Range:` header (§4.3 deliver-side default list).

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

/// Parse a single-range `bytes=start-end` request header against a known total length. Multi-
/// range requests are out of scope (fall back to a full 200 response, matching the default
/// filter list's single-range assumption).
#[must_use]
pub fn parse_range(header: &str, total_len: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    if start_s.is_empty() {
        let suffix_len: u64 = end_s.parse().ok()?;
        if suffix_len == 0 || total_len == 0 {
            return None;
        }
        let start = total_len.saturating_sub(suffix_len);
        return Some(ByteRange { start, end_inclusive: total_len - 1 });
    }
    let start: u64 = start_s.parse().ok()?;
    let end = if end_s.is_empty() {
        total_len.saturating_sub(1)
    } else {
        end_s.parse().ok()?
    };
    if start > end || start >= total_len {
        return None;
    }
    Some(ByteRange { start, end_inclusive: end.min(total_len - 1) })
}

/// Slice `body` according to a resolved range, producing the 206 response payload plus the
/// `Content-Range` header value.
#[must_use]
pub fn apply_range(body: &[u8], range: ByteRange) -> (Vec<u8>, String) {
    let end = (range.end_inclusive as usize).min(body.len().saturating_sub(1));
    let start = (range.start as usize).min(body.len());
    let slice = if start <= end && !body.is_empty() {
        body[start..=end].to_vec()
    } else {
        Vec::new()
    };
    let content_range = format!("bytes {start}-{end}/{}", body.len());
    (slice, content_range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_range() {
        let r = parse_range("bytes=0-4", 100).unwrap();
        assert_eq!(r, ByteRange { start: 0, end_inclusive: 4 });
    }

    #[test]
    fn parses_open_ended_range() {
        let r = parse_range("bytes=10-", 100).unwrap();
        assert_eq!(r, ByteRange { start: 10, end_inclusive: 99 });
    }

    #[test]
    fn parses_suffix_range() {
        let r = parse_range("bytes=-10", 100).unwrap();
        assert_eq!(r, ByteRange { start: 90, end_inclusive: 99 });
    }

    #[test]
    fn rejects_multi_range() {
        assert!(parse_range("bytes=0-1,2-3", 100).is_none());
    }

    #[test]
    fn apply_range_slices_and_reports_content_range() {
        let body = b"0123456789";
        let (slice, cr) = apply_range(body, ByteRange { start: 2, end_inclusive: 5 });
        assert_eq!(slice, b"2345");
        assert_eq!(cr, "bytes 2-5/10");
    }
}
