//! HTTP/2 frame multiplexer (§4.7): connection setup, the per-connection receiver loop, stream
//! state/flow control, and HPACK-backed header decode.
pub mod frame;
pub mod hpack;
pub mod session;
pub mod stream;

pub use session::Session;

#[derive(Debug, thiserror::Error)]
pub enum H2Error {
    #[error("http/2 protocol error: {0}")]
    ProtocolError(String),
    #[error("hpack compression error, connection is fatal")]
    CompressionError(#[from] hpack::HpackError),
    #[error("stream finalized without :scheme")]
    MissingScheme,
    #[error("stream {0} exceeded its header/workspace budget")]
    EnhanceYourCalm(u32),
    #[error("frame exceeded SETTINGS_MAX_FRAME_SIZE")]
    FrameSizeError,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// RFC 7540 §7 error codes, as carried on RST_STREAM/GOAWAY.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}
