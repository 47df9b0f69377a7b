//! Structured log record shape (§3.1 ADDED), emitted through `tracing` in place of the VSL
//! shared-memory transport (an explicit out-of-scope external collaborator; only its tagged
//! record *shape* is reproduced here).
use tracing::{Level, event, Span};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogTag {
    FetchError,
    ConfigError,
    BackendHealth,
    LostHeader,
    BogoHeader,
    Debug,
}

impl LogTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::FetchError => "FetchError",
            LogTag::ConfigError => "ConfigError",
            LogTag::BackendHealth => "BackendHealth",
            LogTag::LostHeader => "LostHeader",
            LogTag::BogoHeader => "BogoHeader",
            LogTag::Debug => "Debug",
        }
    }

    #[must_use]
    fn level(self) -> Level {
        match self {
            LogTag::FetchError | LogTag::ConfigError | LogTag::BogoHeader => Level::WARN,
            LogTag::BackendHealth | LogTag::LostHeader => Level::INFO,
            LogTag::Debug => Level::DEBUG,
        }
    }
}

/// Emit a single tagged record, mirroring how `cache_backend.c`/`cache_http.c` tag VSL records.
pub fn record(tag: LogTag, message: &str) {
    match tag.level() {
        Level::WARN => event!(Level::WARN, tag = tag.as_str(), message),
        Level::INFO => event!(Level::INFO, tag = tag.as_str(), message),
        Level::DEBUG => event!(Level::DEBUG, tag = tag.as_str(), message),
        _ => event!(Level::TRACE, tag = tag.as_str(), message),
    }
}

/// Open a per-request span carrying the synthetic transaction id used in `X-Varnish` (§8
/// scenario 1) and VSL-style correlation.
#[must_use]
pub fn request_span(xid: u64) -> Span {
    tracing::info_span!("request", xid)
}

/// Draw a fresh synthetic transaction id, the direct analogue of the original's per-request
/// `X-Varnish` id allocator.
#[must_use]
pub fn next_xid() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Install the process-wide `tracing` subscriber (env-filter + compact formatting), mirroring
/// how a production accelerator wires up its logging transport at startup.
pub fn init_subscriber(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
