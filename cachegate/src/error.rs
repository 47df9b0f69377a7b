//! Top-level error taxonomy (§7): one `thiserror` enum per subsystem, converging here.
use crate::backend::BeError;
use crate::http1::FramingError;
use crate::http2::H2Error;
use crate::http2::hpack::HpackError;
use crate::filter::FilterError;
use crate::object::StoreError;
use cachegate_core::http::HttpError;
use cachegate_core::proxy::ProxyError;
use cachegate_core::workspace::WsError;

#[derive(Debug, thiserror::Error)]
pub enum CacheGateError {
    #[error("workspace overflow: requested {0} bytes")]
    Workspace(#[from] WsError),

    #[error("backend error: {0}")]
    Backend(#[from] BeError),

    #[error("http/1 framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("http message error: {0}")]
    Http(#[from] HttpError),

    #[error("filter pipeline error: {0}")]
    Filter(#[from] FilterError),

    #[error("http/2 error: {0}")]
    H2(#[from] H2Error),

    #[error("hpack error: {0}")]
    Hpack(#[from] HpackError),

    #[error("proxy protocol error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("config rule failed: {0}")]
    ConfigRuleFailure(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheGateError>;
