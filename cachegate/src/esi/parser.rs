//! Fetch-side ESI parser (§4.4.1): turns an HTML/XML byte stream into the opcode program of
//! `cachegate_core::esi`.
//!
//! Named states track the design-level state machine from §4.4.1; the scanner below is a
//! single-pass implementation of the same transitions (exact encoding is explicitly an
//! implementation detail per the component design).
use cachegate_core::esi::EsiOp;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    NextTag,
    InEsiInclude,
}

/// Parse `body` into an ESI opcode program. `is_gzip` prepends the `GzipMarker` opcode so the
/// deliver-side interpreter knows to re-wrap output in a valid gzip member (§4.4.2).
#[must_use]
pub fn parse(body: &[u8], is_gzip: bool) -> Vec<EsiOp> {
    let mut ops = Vec::new();
    if is_gzip {
        ops.push(EsiOp::GzipMarker);
    }

    let mut state = State::NextTag;
    let mut verbatim_start = 0usize;
    let mut i = 0usize;

    while i < body.len() {
        match state {
            State::NextTag => {
                if body[i..].starts_with(b"<esi:include") {
                    if i > verbatim_start {
                        ops.push(EsiOp::Verbatim { len: (i - verbatim_start) as u64 });
                    }
                    state = State::InEsiInclude;
                    continue;
                }
                if body[i..].starts_with(b"<esi:remove>") {
                    if i > verbatim_start {
                        ops.push(EsiOp::Verbatim { len: (i - verbatim_start) as u64 });
                    }
                    if let Some(close) = find(&body[i..], b"</esi:remove>") {
                        let skip_len = close + b"</esi:remove>".len();
                        ops.push(EsiOp::Skip { len: skip_len as u64 });
                        i += skip_len;
                        verbatim_start = i;
                        continue;
                    }
                }
                if body[i..].starts_with(b"<esi:comment") {
                    if i > verbatim_start {
                        ops.push(EsiOp::Verbatim { len: (i - verbatim_start) as u64 });
                    }
                    if let Some(end) = find(&body[i..], b"/>") {
                        let skip_len = end + 2;
                        ops.push(EsiOp::Skip { len: skip_len as u64 });
                        i += skip_len;
                        verbatim_start = i;
                        continue;
                    }
                }
                i += 1;
            }
            State::InEsiInclude => {
                let Some(rel_end) = find(&body[i..], b"/>") else {
                    // Unterminated include tag: treat the rest as verbatim (not well-formed XML,
                    // outside the parser's conformance goals per §4.4.1 non-goals).
                    state = State::NextTag;
                    verbatim_start = i;
                    continue;
                };
                let tag_end = i + rel_end + 2;
                let tag = std::str::from_utf8(&body[i..tag_end]).unwrap_or("");
                let src = extract_attr(tag, "src").unwrap_or_default();
                let host = extract_attr(tag, "host");
                let continue_on_error = extract_attr(tag, "onerror").as_deref() == Some("continue");

                ops.push(if continue_on_error {
                    EsiOp::Include { src, host }
                } else {
                    EsiOp::IncludeAbort { src, host }
                });
                // The tag's own markup bytes are still sitting in `backing` between `i` and
                // `tag_end`; the deliver side's cursor only advances through Verbatim/Skip runs,
                // so it must be told to drop them here or the next Verbatim reads the wrong slice.
                let tag_len = tag_end - i;
                if tag_len > 0 {
                    ops.push(EsiOp::Skip { len: tag_len as u64 });
                }

                i = tag_end;
                verbatim_start = i;
                state = State::NextTag;
            }
        }
    }

    if body.len() > verbatim_start {
        ops.push(EsiOp::Verbatim { len: (body.len() - verbatim_start) as u64 });
    }

    ops
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn extract_attr(tag: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = tag.find(&marker)? + marker.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_body_is_single_verbatim_run() {
        let ops = parse(b"hello world", false);
        assert_eq!(ops, vec![EsiOp::Verbatim { len: 11 }]);
    }

    #[test]
    fn include_splits_verbatim_runs() {
        let ops = parse(b"AAA<esi:include src=\"/c\"/>BBB", false);
        assert_eq!(
            ops,
            vec![
                EsiOp::Verbatim { len: 3 },
                EsiOp::IncludeAbort { src: "/c".into(), host: None },
                EsiOp::Skip { len: 23 },
                EsiOp::Verbatim { len: 3 },
            ]
        );
    }

    #[test]
    fn onerror_continue_uses_include_not_abort() {
        let ops = parse(b"<esi:include src=\"/c\" onerror=\"continue\"/>", false);
        assert_eq!(
            ops,
            vec![
                EsiOp::Include { src: "/c".into(), host: None },
                EsiOp::Skip { len: 42 },
            ]
        );
    }

    #[test]
    fn gzip_flag_prepends_marker() {
        let ops = parse(b"hi", true);
        assert_eq!(ops[0], EsiOp::GzipMarker);
    }

    #[test]
    fn remove_block_becomes_skip() {
        let ops = parse(b"A<esi:remove>drop me</esi:remove>B", false);
        assert_eq!(
            ops,
            vec![
                EsiOp::Verbatim { len: 1 },
                EsiOp::Skip { len: 33 },
                EsiOp::Verbatim { len: 1 },
            ]
        );
    }
}
