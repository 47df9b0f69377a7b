//! RFC2616-style TTL computation and conditional-GET support (§2 budget line, exercised by §8
//! scenario 1: `Age` growth and `X-Varnish` id chaining on a cache hit).
use std::time::Duration;

use cachegate_core::http::HttpMsg;
use cachegate_core::workspace::Workspace;

/// Decide the cache-control disposition of a fetched response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Ttl {
    pub ttl: Duration,
    pub grace: Duration,
    pub keep: Duration,
    pub cacheable: bool,
}

impl Default for Ttl {
    fn default() -> Self {
        Self { ttl: Duration::ZERO, grace: Duration::ZERO, keep: Duration::ZERO, cacheable: false }
    }
}

/// Compute the TTL for a response given its status and Cache-Control/Expires/Pragma headers.
/// `header` looks up a response header value by case-insensitive name.
pub fn compute_ttl(status: u16, mut header: impl FnMut(&str) -> Option<String>) -> Ttl {
    if !is_cacheable_status(status) {
        return Ttl::default();
    }

    let cache_control = header("Cache-Control");
    if let Some(cc) = &cache_control {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") || lower.contains("private") {
            return Ttl::default();
        }
        if let Some(secs) = directive_seconds(&lower, "s-maxage") {
            return Ttl { ttl: Duration::from_secs(secs), grace: Duration::ZERO, keep: Duration::ZERO, cacheable: true };
        }
        if let Some(secs) = directive_seconds(&lower, "max-age") {
            if lower.contains("no-cache") {
                return Ttl::default();
            }
            return Ttl { ttl: Duration::from_secs(secs), grace: Duration::ZERO, keep: Duration::ZERO, cacheable: true };
        }
        if lower.contains("no-cache") {
            return Ttl::default();
        }
    }

    if let Some(expires) = header("Expires") {
        if let (Some(date), Some(exp)) = (header("Date").and_then(|d| parse_http_date(&d)), parse_http_date(&expires)) {
            let secs = exp.saturating_sub(date);
            return Ttl { ttl: Duration::from_secs(secs), grace: Duration::ZERO, keep: Duration::ZERO, cacheable: secs > 0 };
        }
    }

    Ttl::default()
}

fn is_cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 203 | 204 | 300 | 301 | 404 | 410)
}

fn directive_seconds(lower_cc: &str, name: &str) -> Option<u64> {
    lower_cc.split(',').find_map(|part| {
        let part = part.trim();
        let rest = part.strip_prefix(name)?.trim_start();
        let digits = rest.strip_prefix('=')?.trim();
        digits.parse().ok()
    })
}

/// Minimal RFC 7231 `IMF-fixdate` parser returning Unix-epoch seconds; only the one format this
/// accelerator emits/consumes (`Date`/`Expires`/`Last-Modified`/`If-Modified-Since`) is handled.
#[must_use]
pub fn parse_http_date(s: &str) -> Option<u64> {
    // "Sun, 06 Nov 1994 08:49:37 GMT"
    let parts: Vec<&str> = s.trim().split_whitespace().collect();
    if parts.len() != 6 {
        return None;
    }
    let day: u64 = parts[1].parse().ok()?;
    let month = month_index(parts[2])?;
    let year: u64 = parts[3].parse().ok()?;
    let mut time = parts[4].split(':');
    let hour: u64 = time.next()?.parse().ok()?;
    let minute: u64 = time.next()?.parse().ok()?;
    let second: u64 = time.next()?.parse().ok()?;

    Some(days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second)
}

fn month_index(name: &str) -> Option<u64> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS.iter().position(|&m| m == name).map(|i| i as u64 + 1)
}

/// Howard Hinnant's `days_from_civil` algorithm, converted to days-since-epoch.
fn days_from_civil(y: u64, m: u64, d: u64) -> u64 {
    let y = i64::try_from(y).unwrap_or(1970) - i64::from(m <= 2);
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64; // [0, 399]
    let mp = (m + 9) % 12; // [0, 11]
    let doy = (153 * mp + 2) / 5 + d - 1; // [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // [0, 146096]
    (era * 146_097 + doe as i64 - 719_468).max(0) as u64
}

/// Render the `Age` header value, given the object's insertion time and now.
#[must_use]
pub fn age_header_value(age: Duration) -> String {
    age.as_secs().to_string()
}

/// Conditional GET: does a request's validators satisfy a 304 against the stored object?
#[must_use]
pub fn matches_conditional(ws: &Workspace, req: &HttpMsg, etag: Option<&str>, last_modified: Option<u64>) -> bool {
    if let (Some(req_etag), Some(etag)) = (req.header(ws, "If-None-Match"), etag) {
        return req_etag == etag || req_etag == "*";
    }
    if let (Some(ims), Some(lm)) = (req.header(ws, "If-Modified-Since"), last_modified) {
        if let Some(ims_secs) = parse_http_date(ims) {
            return ims_secs >= lm;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s_maxage_wins_over_max_age() {
        let ttl = compute_ttl(200, |name| match name {
            "Cache-Control" => Some("max-age=30, s-maxage=120".into()),
            _ => None,
        });
        assert_eq!(ttl.ttl, Duration::from_secs(120));
        assert!(ttl.cacheable);
    }

    #[test]
    fn no_store_is_never_cacheable() {
        let ttl = compute_ttl(200, |name| match name {
            "Cache-Control" => Some("no-store".into()),
            _ => None,
        });
        assert!(!ttl.cacheable);
    }

    #[test]
    fn non_cacheable_status_short_circuits() {
        let ttl = compute_ttl(500, |_| Some("max-age=60".into()));
        assert!(!ttl.cacheable);
    }

    #[test]
    fn http_date_parses_known_value() {
        // 1994-11-06 08:49:37 UTC
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(784_111_777));
    }
}
