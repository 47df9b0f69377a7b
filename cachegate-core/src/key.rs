//! Extended `Key:` variant matcher (§4.5 "Key (extended)").
//!
//! Adds a matcher syntax on top of plain name/value Vary-style entries, parsed from a response's
//! `Key:` header:
//! ```text
//! entry := len_hi len_lo  type:u8  name  [value (if type==0) | matcher-prog (if type==1)]
//! matcher-prog := ( ';' ( 'w="' literal '"'    // WORD match
//!                      | 's="' literal '"'   // substring match
//!                      | 'b="' literal '"'   // begins-with match
//!                      | 'c'                 // case-sensitive flag
//!                      | 'n' ) )*            // negation flag
//! ```
use std::fmt::Write as _;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("malformed matcher program: {0}")]
    MalformedMatcher(String),
    #[error("malformed key entry")]
    Malformed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MatcherOp {
    Word(String),
    Substring(String),
    BeginsWith(String),
    CaseSensitive,
    Negate,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KeyEntry {
    Literal { name: String, value: String },
    Matcher { name: String, ops: Vec<MatcherOp> },
}

/// Parse a `;w="..."` / `;s="..."` / `;b="..."` / `;c` / `;n` matcher program.
pub fn parse_matcher_prog(prog: &str) -> Result<Vec<MatcherOp>, KeyError> {
    let mut ops = Vec::new();
    let mut rest = prog;
    while let Some(stripped) = rest.strip_prefix(';') {
        rest = stripped;
        let (op, next) = if let Some(body) = rest.strip_prefix("w=\"") {
            parse_quoted(body, MatcherOp::Word as fn(String) -> MatcherOp)?
        } else if let Some(body) = rest.strip_prefix("s=\"") {
            parse_quoted(body, MatcherOp::Substring as fn(String) -> MatcherOp)?
        } else if let Some(body) = rest.strip_prefix("b=\"") {
            parse_quoted(body, MatcherOp::BeginsWith as fn(String) -> MatcherOp)?
        } else if let Some(body) = rest.strip_prefix('c') {
            (MatcherOp::CaseSensitive, body)
        } else if let Some(body) = rest.strip_prefix('n') {
            (MatcherOp::Negate, body)
        } else {
            return Err(KeyError::MalformedMatcher(rest.to_string()));
        };
        ops.push(op);
        rest = next;
    }
    if !rest.is_empty() {
        return Err(KeyError::MalformedMatcher(rest.to_string()));
    }
    Ok(ops)
}

fn parse_quoted(
    body: &str,
    make: fn(String) -> MatcherOp,
) -> Result<(MatcherOp, &str), KeyError> {
    let end = body
        .find('"')
        .ok_or_else(|| KeyError::MalformedMatcher(body.to_string()))?;
    Ok((make(body[..end].to_string()), &body[end + 1..]))
}

#[must_use]
pub fn render_matcher_prog(ops: &[MatcherOp]) -> String {
    let mut out = String::new();
    for op in ops {
        match op {
            MatcherOp::Word(lit) => { let _ = write!(out, ";w=\"{lit}\""); }
            MatcherOp::Substring(lit) => { let _ = write!(out, ";s=\"{lit}\""); }
            MatcherOp::BeginsWith(lit) => { let _ = write!(out, ";b=\"{lit}\""); }
            MatcherOp::CaseSensitive => out.push_str(";c"),
            MatcherOp::Negate => out.push_str(";n"),
        }
    }
    out
}

/// Build the `Key:` fingerprint (the object's `Key:` response header value, comma-separated
/// `name[;matcher-prog]` entries) by looking up each named header in the live request via
/// `lookup`. An entry with no matcher suffix behaves like a plain `Vary` entry, captured against
/// the request that produced this response; an entry with a suffix stores the matcher program
/// instead, to be evaluated fresh against each later lookup.
#[cfg(feature = "key-matcher")]
pub fn build<'a>(
    key_header: &str,
    mut lookup: impl FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
) -> Result<Vec<KeyEntry>, KeyError> {
    let mut entries = Vec::new();
    for raw in key_header.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, prog) = match raw.find(';') {
            Some(idx) => (raw[..idx].trim(), &raw[idx..]),
            None => (raw, ""),
        };
        if name.is_empty() {
            return Err(KeyError::Malformed);
        }
        if prog.is_empty() {
            let value = lookup(name).map(|v| v.trim_end().to_string()).unwrap_or_default();
            entries.push(KeyEntry::Literal { name: name.to_string(), value });
        } else {
            let ops = parse_matcher_prog(prog)?;
            entries.push(KeyEntry::Matcher { name: name.to_string(), ops });
        }
    }
    Ok(entries)
}

#[cfg(feature = "key-matcher")]
#[derive(Debug, Eq, PartialEq)]
pub enum KeyMatchResult {
    Same,
    Miss,
}

/// Match a stored `Key:` fingerprint against a live request: `Literal` entries compare by exact
/// value like `Vary`; `Matcher` entries evaluate their opcode program against the live value.
#[cfg(feature = "key-matcher")]
pub fn matches<'a>(
    stored: &[KeyEntry],
    mut lookup: impl FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
) -> KeyMatchResult {
    for entry in stored {
        let live_matches = match entry {
            KeyEntry::Literal { name, value } => {
                let live = lookup(name).map(|v| v.trim_end().to_string()).unwrap_or_default();
                live == *value
            }
            KeyEntry::Matcher { name, ops } => {
                let live = lookup(name).map(|v| v.trim_end().to_string()).unwrap_or_default();
                eval_matcher(ops, &live)
            }
        };
        if !live_matches {
            return KeyMatchResult::Miss;
        }
    }
    KeyMatchResult::Same
}

/// Evaluate a matcher program against a live request header value.
#[must_use]
pub fn eval_matcher(ops: &[MatcherOp], value: &str) -> bool {
    let case_sensitive = ops.iter().any(|o| matches!(o, MatcherOp::CaseSensitive));
    let negate = ops.iter().any(|o| matches!(o, MatcherOp::Negate));
    let cmp = |a: &str, b: &str| -> bool {
        if case_sensitive {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    };
    let contains = |hay: &str, needle: &str| -> bool {
        if case_sensitive {
            hay.contains(needle)
        } else {
            hay.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
        }
    };
    let starts_with = |hay: &str, needle: &str| -> bool {
        if case_sensitive {
            hay.starts_with(needle)
        } else {
            hay.len() >= needle.len()
                && hay[..needle.len()].eq_ignore_ascii_case(needle)
        }
    };

    let matched = ops.iter().any(|op| match op {
        MatcherOp::Word(lit) => value.split_whitespace().any(|w| cmp(w, lit)),
        MatcherOp::Substring(lit) => contains(value, lit),
        MatcherOp::BeginsWith(lit) => starts_with(value, lit),
        MatcherOp::CaseSensitive | MatcherOp::Negate => false,
    });
    matched != negate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_eval_word() {
        let ops = parse_matcher_prog(";w=\"ipad\"").unwrap();
        assert!(eval_matcher(&ops, "Mozilla ipad Safari"));
        assert!(!eval_matcher(&ops, "Mozilla iphone Safari"));
    }

    #[test]
    fn negate_flips_result() {
        let ops = parse_matcher_prog(";s=\"bot\";n").unwrap();
        assert!(!eval_matcher(&ops, "Googlebot/2.1"));
        assert!(eval_matcher(&ops, "Mozilla/5.0"));
    }

    #[test]
    fn case_sensitive_flag() {
        let ops = parse_matcher_prog(";w=\"IPAD\";c").unwrap();
        assert!(!eval_matcher(&ops, "ipad"));
        assert!(eval_matcher(&ops, "IPAD here"));
    }

    #[test]
    fn render_roundtrip() {
        let ops = vec![MatcherOp::BeginsWith("Mo".into()), MatcherOp::CaseSensitive];
        let rendered = render_matcher_prog(&ops);
        assert_eq!(parse_matcher_prog(&rendered).unwrap(), ops);
    }

    #[cfg(feature = "key-matcher")]
    #[test]
    fn build_mixes_literal_and_matcher_entries() {
        let entries = build("Cookie, User-Agent;w=\"mobile\"", |name| match name {
            "Cookie" => Some("session=abc".into()),
            "User-Agent" => Some("Mozilla mobile Safari".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(
            entries,
            vec![
                KeyEntry::Literal { name: "Cookie".into(), value: "session=abc".into() },
                KeyEntry::Matcher {
                    name: "User-Agent".into(),
                    ops: vec![MatcherOp::Word("mobile".into())],
                },
            ]
        );
    }

    #[cfg(feature = "key-matcher")]
    #[test]
    fn matches_evaluates_matcher_entries_fresh_each_time() {
        let stored = vec![KeyEntry::Matcher {
            name: "User-Agent".into(),
            ops: vec![MatcherOp::Word("mobile".into())],
        }];
        assert_eq!(
            matches(&stored, |_| Some("Mozilla mobile Safari".into())),
            KeyMatchResult::Same
        );
        assert_eq!(
            matches(&stored, |_| Some("Mozilla desktop Safari".into())),
            KeyMatchResult::Miss
        );
    }

    #[cfg(feature = "key-matcher")]
    #[test]
    fn matches_treats_literal_entries_like_vary() {
        let stored = vec![KeyEntry::Literal { name: "Cookie".into(), value: "a=1".into() }];
        assert_eq!(matches(&stored, |_| Some("a=1".into())), KeyMatchResult::Same);
        assert_eq!(matches(&stored, |_| Some("a=2".into())), KeyMatchResult::Miss);
    }
}
