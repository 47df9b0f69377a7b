//! HTTP/1 wire framing (§4.6/§6): `httparse`-backed head parsing into the shared `HttpMsg` store,
//! plus request/response body framing (Content-Length, chunked, close-delimited).
use cachegate_core::http::{HttpMsg, MsgKind};
use cachegate_core::workspace::Workspace;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("malformed http/1 head: {0}")]
    Malformed(String),
    #[error("more headers than the configured capacity ({0})")]
    TooManyHeaders(usize),
    #[error("conflicting content-length and transfer-encoding framing")]
    ConflictingFraming,
    #[error("invalid chunk framing")]
    BadChunk,
    #[error(transparent)]
    Workspace(#[from] cachegate_core::workspace::WsError),
    #[error(transparent)]
    Http(#[from] cachegate_core::http::HttpError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
    CloseDelimited,
    None,
}

/// Parse a full HTTP/1 request head off `buf` (must already contain a terminating `\r\n\r\n`),
/// returning the populated `HttpMsg` plus how many bytes of `buf` the head consumed.
pub fn parse_request(ws: &mut Workspace, buf: &[u8], max_headers: usize) -> Result<(HttpMsg, usize), FramingError> {
    let mut storage = vec![httparse::EMPTY_HEADER; max_headers];
    let mut req = httparse::Request::new(&mut storage);
    let status = req.parse(buf).map_err(|e| FramingError::Malformed(e.to_string()))?;
    let httparse::Status::Complete(consumed) = status else {
        return Err(FramingError::Malformed("incomplete request head".into()));
    };
    if req.headers.iter().all(|h| !h.name.is_empty()) && req.headers.len() == max_headers {
        return Err(FramingError::TooManyHeaders(max_headers));
    }

    let method = req.method.ok_or_else(|| FramingError::Malformed("missing method".into()))?;
    let path = req.path.ok_or_else(|| FramingError::Malformed("missing path".into()))?;
    let version = if req.version == Some(1) { "HTTP/1.1" } else { "HTTP/1.0" };

    let mut msg = HttpMsg::new(MsgKind::Request, max_headers as u16);
    msg.set_request_line(ws, method, path, version)?;
    for h in req.headers.iter().take_while(|h| !h.name.is_empty()) {
        let value = std::str::from_utf8(h.value).map_err(|_| FramingError::Malformed("non-utf8 header value".into()))?;
        msg.set_header(ws, h.name, value)?;
    }
    Ok((msg, consumed))
}

/// Parse a full HTTP/1 response head off `buf`.
pub fn parse_response(ws: &mut Workspace, buf: &[u8], max_headers: usize) -> Result<(HttpMsg, usize), FramingError> {
    let mut storage = vec![httparse::EMPTY_HEADER; max_headers];
    let mut resp = httparse::Response::new(&mut storage);
    let status = resp.parse(buf).map_err(|e| FramingError::Malformed(e.to_string()))?;
    let httparse::Status::Complete(consumed) = status else {
        return Err(FramingError::Malformed("incomplete response head".into()));
    };

    let code = resp.code.ok_or_else(|| FramingError::Malformed("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("");
    let version = if resp.version == Some(1) { "HTTP/1.1" } else { "HTTP/1.0" };

    let mut msg = HttpMsg::new(MsgKind::Response, max_headers as u16);
    msg.set_status_line(ws, version, code, reason)?;
    for h in resp.headers.iter().take_while(|h| !h.name.is_empty()) {
        let value = std::str::from_utf8(h.value).map_err(|_| FramingError::Malformed("non-utf8 header value".into()))?;
        msg.set_header(ws, h.name, value)?;
    }
    Ok((msg, consumed))
}

/// Resolve how a message's body is framed (RFC 7230 §3.3.3), preferring `Transfer-Encoding` over
/// `Content-Length` and rejecting the two together, same as the teacher's HTC layer.
pub fn determine_framing(msg: &HttpMsg, ws: &Workspace) -> Result<BodyFraming, FramingError> {
    let te = msg.header(ws, "transfer-encoding");
    let cl = msg.header(ws, "content-length");
    if let Some(te) = te {
        if te.rsplit(',').next().is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked")) {
            if cl.is_some() {
                return Err(FramingError::ConflictingFraming);
            }
            return Ok(BodyFraming::Chunked);
        }
    }
    if let Some(cl) = cl {
        let n: u64 = cl.trim().parse().map_err(|_| FramingError::Malformed(format!("bad content-length {cl:?}")))?;
        return Ok(BodyFraming::ContentLength(n));
    }
    Ok(BodyFraming::None)
}

/// Encode a response head (status line + headers + terminating blank line) to the wire.
#[must_use]
pub fn encode_response_head(msg: &HttpMsg, ws: &Workspace) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(msg.proto(ws).unwrap_or("HTTP/1.1").as_bytes());
    out.push(b' ');
    out.extend_from_slice(msg.status(ws).unwrap_or(200).to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(msg.reason(ws).unwrap_or("OK").as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in msg.iter(ws) {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Encode one `Transfer-Encoding: chunked` chunk; an empty `data` emits the terminating
/// zero-length chunk (callers append `\r\n` trailers themselves if any).
#[must_use]
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataCrlf,
    TrailerOrEnd,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder: feed it arbitrarily-sized slices of the wire
/// stream and it emits decoded body bytes plus how much of the input it consumed.
pub struct ChunkedDecoder {
    state: ChunkedState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { state: ChunkedState::Size }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == ChunkedState::Done
    }

    /// Feed more wire bytes; returns `(decoded_body_bytes, consumed_from_buf)`. Call repeatedly as
    /// more bytes arrive until `is_done()`.
    pub fn feed(&mut self, buf: &[u8]) -> Result<(Vec<u8>, usize), FramingError> {
        let mut decoded = Vec::new();
        let mut pos = 0usize;
        loop {
            match self.state {
                ChunkedState::Done => break,
                ChunkedState::Size => {
                    let Some(line_end) = find_crlf(&buf[pos..]) else { break };
                    let line = &buf[pos..pos + line_end];
                    let line_str = std::str::from_utf8(line).map_err(|_| FramingError::BadChunk)?;
                    let size_str = line_str.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16).map_err(|_| FramingError::BadChunk)?;
                    pos += line_end + 2;
                    self.state = if size == 0 { ChunkedState::TrailerOrEnd } else { ChunkedState::Data(size) };
                }
                ChunkedState::Data(remaining) => {
                    let available = (buf.len() - pos) as u64;
                    let take = available.min(remaining);
                    decoded.extend_from_slice(&buf[pos..pos + take as usize]);
                    pos += take as usize;
                    let left = remaining - take;
                    if left == 0 {
                        self.state = ChunkedState::DataCrlf;
                    } else {
                        self.state = ChunkedState::Data(left);
                        break;
                    }
                }
                ChunkedState::DataCrlf => {
                    if buf.len() - pos < 2 {
                        break;
                    }
                    if &buf[pos..pos + 2] != b"\r\n" {
                        return Err(FramingError::BadChunk);
                    }
                    pos += 2;
                    self.state = ChunkedState::Size;
                }
                ChunkedState::TrailerOrEnd => {
                    let Some(line_end) = find_crlf(&buf[pos..]) else { break };
                    if line_end == 0 {
                        pos += 2;
                        self.state = ChunkedState::Done;
                        break;
                    }
                    // Trailer field: skip it (cachegate doesn't surface trailers, §4.6 non-goal).
                    pos += line_end + 2;
                }
            }
        }
        Ok((decoded, pos))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_request() {
        let mut ws = Workspace::new(4096);
        let raw = b"GET /hello HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let (msg, consumed) = parse_request(&mut ws, raw, 16).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(msg.method(&ws), Some("GET"));
        assert_eq!(msg.url(&ws), Some("/hello"));
        assert_eq!(msg.header(&ws, "host"), Some("example.com"));
    }

    #[test]
    fn parses_response_and_framing() {
        let mut ws = Workspace::new(4096);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let (msg, _) = parse_response(&mut ws, raw, 16).unwrap();
        assert_eq!(msg.status(&ws), Some(200));
        assert_eq!(determine_framing(&msg, &ws).unwrap(), BodyFraming::ContentLength(5));
    }

    #[test]
    fn chunked_and_content_length_conflict_is_rejected() {
        let mut ws = Workspace::new(4096);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (msg, _) = parse_response(&mut ws, raw, 16).unwrap();
        assert!(matches!(determine_framing(&msg, &ws), Err(FramingError::ConflictingFraming)));
    }

    #[test]
    fn chunked_decoder_handles_single_feed() {
        let mut dec = ChunkedDecoder::new();
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (decoded, consumed) = dec.feed(wire).unwrap();
        assert_eq!(decoded, b"hello world");
        assert_eq!(consumed, wire.len());
        assert!(dec.is_done());
    }

    #[test]
    fn chunked_decoder_handles_partial_feeds() {
        let mut dec = ChunkedDecoder::new();
        let (decoded1, consumed1) = dec.feed(b"5\r\nhel").unwrap();
        assert_eq!(decoded1, b"hel");
        assert!(!dec.is_done());
        let rest = b"lo\r\n0\r\n\r\n";
        let (decoded2, consumed2) = dec.feed(rest).unwrap();
        assert_eq!(decoded2, b"lo");
        assert_eq!(consumed1, 6);
        assert_eq!(consumed2, rest.len());
        assert!(dec.is_done());
    }

    #[test]
    fn encode_chunk_roundtrips_through_decoder() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_chunk(b"abc"));
        wire.extend_from_slice(&encode_chunk(b""));
        let mut dec = ChunkedDecoder::new();
        let (decoded, _) = dec.feed(&wire).unwrap();
        assert_eq!(decoded, b"abc");
        assert!(dec.is_done());
    }
}
