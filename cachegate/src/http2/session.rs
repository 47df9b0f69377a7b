//! Per-connection HTTP/2 engine: owns the stream table and connection-level flow-control windows,
//! and runs the receiver loop (§4.7/§5) that reads and dispatches frames while workers block on
//! per-stream `Notify` handles - the async analogue of the teacher's per-session mutex+condvar.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, Notify};

use super::frame::{
    self, FrameFlags, FrameHeader, FrameType, FRAME_HEADER_LEN, SETTINGS_HEADER_TABLE_SIZE,
    SETTINGS_INITIAL_WINDOW_SIZE,
};
use super::hpack::Decoder as HpackDecoder;
use super::stream::{finish_headers, validate_field, Pseudoheaders, Stream, StreamState, DEFAULT_WINDOW_SIZE};
use super::{ErrorCode, H2Error};

/// A fully decoded, validated request projected off a finished HEADERS block.
#[derive(Debug, Clone)]
pub struct H2Request {
    pub stream_id: u32,
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub headers: Vec<(String, String)>,
}

pub struct GoAway {
    pub last_stream_id: u32,
    pub error_code: u32,
    pub debug_data: Vec<u8>,
}

struct HeaderAssembly {
    buf: Vec<u8>,
    stream_id: u32,
}

struct SessionState {
    streams: HashMap<u32, Stream>,
    stream_notify: HashMap<u32, Arc<Notify>>,
    decoder: HpackDecoder,
    connection_self_window: i64,
    connection_peer_window: i64,
    max_header_list_budget: usize,
    in_progress_headers: Option<HeaderAssembly>,
    last_peer_ping: Option<[u8; 8]>,
    goaway: Option<GoAway>,
    closed: bool,
    ready_requests: Vec<H2Request>,
    /// Stream-fatal errors waiting to be turned into an outbound `RST_STREAM` frame by whichever
    /// task owns the connection's write half (§4.7: the receiver never writes to the socket).
    pending_resets: Vec<(u32, u32)>,
}

impl SessionState {
    fn new(header_table_size: usize, max_header_list_budget: usize) -> Self {
        Self {
            streams: HashMap::new(),
            stream_notify: HashMap::new(),
            decoder: HpackDecoder::new(header_table_size),
            connection_self_window: DEFAULT_WINDOW_SIZE,
            connection_peer_window: DEFAULT_WINDOW_SIZE,
            max_header_list_budget,
            in_progress_headers: None,
            last_peer_ping: None,
            goaway: None,
            closed: false,
            ready_requests: Vec::new(),
            pending_resets: Vec::new(),
        }
    }

    fn stream_mut(&mut self, id: u32) -> &mut Stream {
        self.streams.entry(id).or_insert_with(|| Stream::new(id, DEFAULT_WINDOW_SIZE))
    }

    fn notify_for(&mut self, id: u32) -> Arc<Notify> {
        self.stream_notify.entry(id).or_insert_with(|| Arc::new(Notify::new())).clone()
    }
}

/// Apply a decoded SETTINGS payload's (id, value) pairs (RFC 7540 §6.5.1), shared by the normal
/// SETTINGS-frame path and the `h2c` upgrade handshake's `HTTP2-Settings:` header.
fn apply_settings(state: &mut SessionState, payload: &[u8]) {
    for (id, value) in frame::parse_settings(payload) {
        if id == SETTINGS_INITIAL_WINDOW_SIZE {
            let delta = i64::from(value) - DEFAULT_WINDOW_SIZE;
            for s in state.streams.values_mut() {
                s.apply_initial_window_delta(delta);
            }
        } else if id == SETTINGS_HEADER_TABLE_SIZE {
            state.decoder.set_max_dynamic_size(value as usize);
        }
    }
}

/// The owning handle a worker (or the accept loop) holds for one HTTP/2 connection.
pub struct Session {
    state: Arc<Mutex<SessionState>>,
    teardown: Arc<Notify>,
}

impl Session {
    #[must_use]
    pub fn new(header_table_size: usize, max_header_list_budget: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::new(header_table_size, max_header_list_budget))),
            teardown: Arc::new(Notify::new()),
        }
    }

    /// Drives the receiver loop over `io` until the connection closes or a connection-fatal error
    /// occurs. Mirrors the teacher's dedicated receiver thread: reads frames, dispatches, enqueues,
    /// never writes to the socket itself.
    pub async fn run_receiver<R: AsyncRead + Unpin>(&self, mut io: R) -> Result<(), H2Error> {
        loop {
            let mut header_buf = [0u8; FRAME_HEADER_LEN];
            tokio::select! {
                res = io.read_exact(&mut header_buf) => {
                    match res {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                        Err(e) => return Err(H2Error::Io(e)),
                    }
                }
                () = self.teardown.notified() => return Ok(()),
            }
            let header = frame::parse_header(&header_buf);
            let mut payload = vec![0u8; header.length as usize];
            io.read_exact(&mut payload).await?;
            self.dispatch(header, &payload).await?;
        }
    }

    async fn dispatch(&self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        let mut state = self.state.lock().await;
        match header.frame_type {
            FrameType::Data => {
                let end_stream = header.flags.contains(FrameFlags::END_STREAM);
                state.connection_self_window -= payload.len() as i64;
                state.stream_mut(header.stream_id).on_data(payload, end_stream);
                let notify = state.notify_for(header.stream_id);
                drop(state);
                notify.notify_waiters();
            }
            FrameType::Headers | FrameType::Continuation => {
                let stream_id = header.stream_id;
                let result = self.on_headers_or_continuation(&mut state, header, payload).and_then(|()| {
                    if header.flags.contains(FrameFlags::END_HEADERS) {
                        self.finish_header_block(&mut state)
                    } else {
                        Ok(())
                    }
                });
                // §4.7/§7 error kind 5: a malformed header block is a stream error, not a
                // connection error - the HPACK dynamic table is only touched by a successful
                // `decode_block`, so the connection's compression state stays in sync and the
                // receiver loop can keep going once this stream is reset.
                if let Err(e) = result {
                    match stream_error_code(&e) {
                        Some(code) => {
                            state.stream_mut(stream_id).state = StreamState::Closed;
                            state.pending_resets.push((stream_id, code));
                        }
                        None => return Err(e),
                    }
                }
                let notify = state.notify_for(stream_id);
                drop(state);
                notify.notify_waiters();
            }
            FrameType::Priority => {
                let (dep, exclusive, weight) = parse_priority(payload)?;
                let stream = state.stream_mut(header.stream_id);
                stream.dependency = Some(dep);
                stream.exclusive = exclusive;
                stream.weight = weight;
            }
            FrameType::RstStream => {
                if payload.len() < 4 {
                    return Err(H2Error::ProtocolError("short RST_STREAM".into()));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let stream = state.stream_mut(header.stream_id);
                stream.rst_error_code = Some(code);
                stream.state = StreamState::Closed;
            }
            FrameType::Settings => {
                if !header.flags.contains(FrameFlags::ACK) {
                    apply_settings(&mut state, payload);
                }
            }
            FrameType::PushPromise => {
                // Clients don't originate server push; treat a received PUSH_PROMISE as fatal.
                return Err(H2Error::ProtocolError("unexpected PUSH_PROMISE from client".into()));
            }
            FrameType::Ping => {
                if payload.len() == 8 && !header.flags.contains(FrameFlags::ACK) {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(payload);
                    state.last_peer_ping = Some(buf);
                }
            }
            FrameType::GoAway => {
                if payload.len() >= 8 {
                    let last_stream_id =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
                    let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    state.goaway = Some(GoAway { last_stream_id, error_code, debug_data: payload[8..].to_vec() });
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() < 4 {
                    return Err(H2Error::ProtocolError("short WINDOW_UPDATE".into()));
                }
                let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
                if header.stream_id == 0 {
                    state.connection_peer_window += i64::from(increment);
                } else {
                    state.stream_mut(header.stream_id).apply_window_update(increment);
                }
            }
            FrameType::Unknown(_) => {}
        }
        Ok(())
    }

    fn on_headers_or_continuation(
        &self,
        state: &mut SessionState,
        header: FrameHeader,
        payload: &[u8],
    ) -> Result<(), H2Error> {
        let assembly = state
            .in_progress_headers
            .get_or_insert_with(|| HeaderAssembly { buf: Vec::new(), stream_id: header.stream_id });
        if assembly.stream_id != header.stream_id {
            return Err(H2Error::ProtocolError("CONTINUATION for wrong stream".into()));
        }
        let body = strip_headers_padding_and_priority(header, payload)?;
        assembly.buf.extend_from_slice(body);
        if assembly.buf.len() > state.max_header_list_budget {
            let sid = header.stream_id;
            state.in_progress_headers = None;
            state.stream_mut(sid).state = StreamState::Closed;
            return Err(H2Error::EnhanceYourCalm(sid));
        }
        Ok(())
    }

    fn finish_header_block(&self, state: &mut SessionState) -> Result<(), H2Error> {
        let Some(assembly) = state.in_progress_headers.take() else { return Ok(()) };
        let decoded = state.decoder.decode_block(&assembly.buf)?;

        let mut pseudo = Pseudoheaders::default();
        let mut fields = Vec::new();
        let mut seen_regular = false;
        for (name, value) in decoded {
            if let Err(e) = validate_field(&name, &value, &mut pseudo, &mut fields, &mut seen_regular) {
                state.stream_mut(assembly.stream_id).state = StreamState::Closed;
                return Err(e);
            }
        }
        let (method, path, scheme, fields) = finish_headers(pseudo, fields)?;
        state.stream_mut(assembly.stream_id).state = StreamState::Open;
        state.ready_requests.push(H2Request { stream_id: assembly.stream_id, method, path, scheme, headers: fields });
        Ok(())
    }

    /// Seed stream 1 with the request that arrived as the HTTP/1.1 `Upgrade: h2c` request that
    /// triggered this session (RFC 7540 §3.2): it never crosses the wire as HEADERS/CONTINUATION
    /// frames, so this stands in for `finish_header_block` for that one stream. The client has
    /// nothing left to send on it — whatever body the request had was already delivered over
    /// HTTP/1.1 before the switch — so the stream goes straight to half-closed-remote.
    pub async fn seed_upgrade_request(&self, req: H2Request) {
        let mut state = self.state.lock().await;
        state.stream_mut(req.stream_id).state = StreamState::HalfClosedRemote;
        state.ready_requests.push(req);
    }

    /// Apply the `HTTP2-Settings:` header's decoded payload (RFC 7540 §3.2.1) as this
    /// connection's initial peer settings, before the receiver loop has read a single frame.
    pub async fn apply_upgrade_settings(&self, payload: &[u8]) {
        let mut state = self.state.lock().await;
        apply_settings(&mut state, payload);
    }

    /// Pop a fully-decoded request that arrived since the last call, if any.
    pub async fn try_take_request(&self, stream_id: u32) -> Option<H2Request> {
        let mut state = self.state.lock().await;
        let pos = state.ready_requests.iter().position(|r| r.stream_id == stream_id)?;
        Some(state.ready_requests.remove(pos))
    }

    /// Blocks until `stream_id` has a request ready or the connection tears down - the
    /// worker-side half of the per-stream condvar wait described in §4.7/§5.
    pub async fn wait_for_request(&self, stream_id: u32) -> Option<H2Request> {
        loop {
            if let Some(req) = self.try_take_request(stream_id).await {
                return Some(req);
            }
            let notify = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                state.notify_for(stream_id)
            };
            tokio::select! {
                () = notify.notified() => {}
                () = self.teardown.notified() => return None,
            }
        }
    }

    /// Session teardown (§4.7): clears state, wakes every stream waiter, stops the receiver.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        let notifies: Vec<_> = state.stream_notify.values().cloned().collect();
        drop(state);
        for n in notifies {
            n.notify_waiters();
        }
        self.teardown.notify_waiters();
    }

    pub async fn connection_peer_window(&self) -> i64 {
        self.state.lock().await.connection_peer_window
    }

    pub async fn stream_peer_window(&self, stream_id: u32) -> i64 {
        self.state.lock().await.stream_mut(stream_id).peer_window
    }

    /// Record that `len` bytes of DATA were sent on `stream_id`, decrementing both windows (P5).
    pub async fn on_data_sent(&self, stream_id: u32, len: usize) {
        let mut state = self.state.lock().await;
        state.connection_peer_window -= len as i64;
        state.stream_mut(stream_id).on_data_sent(len);
    }

    /// Drain the `(stream_id, error_code)` pairs queued by stream-fatal header errors since the
    /// last call. The connection's writer-owning task turns each into a real `RST_STREAM` frame
    /// (§4.7: the receiver itself never writes to the socket).
    pub async fn take_pending_resets(&self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.state.lock().await.pending_resets)
    }
}

/// Classify an `H2Error` raised while assembling/decoding a header block: `Some(code)` means the
/// failure is scoped to the one stream and should become an outbound `RST_STREAM`; `None` means
/// it corrupted connection-wide state (HPACK dynamic table desync, a broken socket) and must tear
/// the whole connection down.
fn stream_error_code(e: &H2Error) -> Option<u32> {
    match e {
        H2Error::CompressionError(_) | H2Error::Io(_) => None,
        H2Error::ProtocolError(_) | H2Error::MissingScheme => Some(ErrorCode::ProtocolError as u32),
        H2Error::EnhanceYourCalm(_) => Some(ErrorCode::EnhanceYourCalm as u32),
        H2Error::FrameSizeError => Some(ErrorCode::FrameSizeError as u32),
    }
}

fn parse_priority(payload: &[u8]) -> Result<(u32, bool, u8), H2Error> {
    if payload.len() < 5 {
        return Err(H2Error::ProtocolError("short PRIORITY frame".into()));
    }
    let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let exclusive = raw & 0x8000_0000 != 0;
    let dependency = raw & 0x7fff_ffff;
    let weight = payload[4];
    Ok((dependency, exclusive, weight))
}

/// Strip PADDED/PRIORITY framing from a HEADERS frame's payload, returning just the header block
/// fragment. CONTINUATION frames carry no such framing.
fn strip_headers_padding_and_priority(header: FrameHeader, payload: &[u8]) -> Result<&[u8], H2Error> {
    if header.frame_type == FrameType::Continuation {
        return Ok(payload);
    }
    let mut cursor = 0usize;
    let pad_len = if header.flags.contains(FrameFlags::PADDED) {
        let p = *payload.first().ok_or_else(|| H2Error::ProtocolError("truncated HEADERS".into()))? as usize;
        cursor += 1;
        p
    } else {
        0
    };
    if header.flags.contains(FrameFlags::PRIORITY) {
        cursor += 5;
    }
    let end = payload
        .len()
        .checked_sub(pad_len)
        .ok_or_else(|| H2Error::ProtocolError("pad length exceeds frame".into()))?;
    payload.get(cursor..end).ok_or_else(|| H2Error::ProtocolError("truncated HEADERS".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_headers_frame(stream_id: u32, block: &[u8], end_headers: bool) -> Vec<u8> {
        let flags = if end_headers { FrameFlags::END_HEADERS } else { FrameFlags::empty() };
        let mut out = frame::encode_header(0x1, flags | FrameFlags::END_STREAM, stream_id, block.len() as u32).to_vec();
        out.extend_from_slice(block);
        out
    }

    #[tokio::test]
    async fn simple_get_request_decodes_and_becomes_available() {
        let session = Session::new(4096, 16 * 1024);
        let block = vec![0x82, 0x84, 0x86]; // :method GET, :path /, :scheme https
        let wire = encode_headers_frame(1, &block, true);

        session.run_receiver(std::io::Cursor::new(wire)).await.unwrap();
        let req = session.try_take_request(1).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
        assert_eq!(req.scheme, "https");
    }

    #[tokio::test]
    async fn bad_casing_header_is_rejected_as_stream_error_not_connection_fatal() {
        let session = Session::new(4096, 16 * 1024);
        let mut bad_block = vec![0x82, 0x84, 0x86];
        bad_block.push(0x40); // literal w/ incremental indexing, new name
        super::super::hpack::encode_string(&mut bad_block, "Upper-Case");
        super::super::hpack::encode_string(&mut bad_block, "x");
        let mut wire = encode_headers_frame(1, &bad_block, true);
        // A second, well-formed request on another stream, read by the same receiver loop.
        let good_block = vec![0x82, 0x84, 0x86];
        wire.extend_from_slice(&encode_headers_frame(3, &good_block, true));

        session.run_receiver(std::io::Cursor::new(wire)).await.unwrap();

        assert!(session.try_take_request(1).await.is_none());
        let resets = session.take_pending_resets().await;
        assert_eq!(resets, vec![(1, ErrorCode::ProtocolError as u32)]);

        let good = session.try_take_request(3).await.unwrap();
        assert_eq!(good.method, "GET");
    }

    #[tokio::test]
    async fn window_update_increases_peer_window() {
        let session = Session::new(4096, 16 * 1024);
        let mut wire = frame::encode_header(0x8, FrameFlags::empty(), 0, 4).to_vec();
        wire.extend_from_slice(&1000u32.to_be_bytes());
        session.run_receiver(std::io::Cursor::new(wire)).await.unwrap();
        assert_eq!(session.connection_peer_window().await, DEFAULT_WINDOW_SIZE + 1000);
    }

    #[tokio::test]
    async fn settings_initial_window_size_shifts_existing_stream_peer_window() {
        let session = Session::new(4096, 16 * 1024);
        {
            let mut state = session.state.lock().await;
            state.stream_mut(1);
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        payload.extend_from_slice(&100u32.to_be_bytes());
        let mut wire = frame::encode_header(0x4, FrameFlags::empty(), 0, payload.len() as u32).to_vec();
        wire.extend_from_slice(&payload);
        session.run_receiver(std::io::Cursor::new(wire)).await.unwrap();
        assert_eq!(session.stream_peer_window(1).await, 100);
    }
}
