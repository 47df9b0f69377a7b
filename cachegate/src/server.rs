//! The server loop (§1.1/§5): per-listener accept loop, per-connection worker task, and the
//! cache lookup/fetch/deliver pipeline that ties backend, store, filters and ESI together.
//!
//! Mirrors the teacher's split between a listener task and a pool of per-connection workers, with
//! `tokio::spawn` standing in for the pthread-per-session model (§5 CONCURRENCY).
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use cachegate_core::http::{HttpMsg, MsgKind};
use cachegate_core::vary;
use cachegate_core::workspace::Workspace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::backend::Director;
use crate::config::{Config, ConfigHandle, ListenerConfig, ListenerProto};
use crate::esi::deliver::{deliver, IncludeFetcher};
use crate::filter::{
    self, Action, Chain, DeliverDisposition, DeliverStage, FetchDisposition, FetchStage,
};
use crate::filter::esi::EsiParseFilter;
use crate::filter::gunzip::GunzipFilter;
use crate::filter::gzip::GzipFilter;
use crate::filter::testgunzip::TestGunzipFilter;
use crate::http1::{self, BodyFraming, ChunkedDecoder};
use crate::http2::frame::{self, FrameFlags, CLIENT_PREFACE};
use crate::http2::hpack::encode_literal_without_indexing;
use crate::http2::session::H2Request;
use crate::http2::Session;
use crate::object::{Boc, BocState, ObjFlags, ObjectCore, ObjectKey, Stevedore};
use crate::proxy_listener;
use crate::vsl::{next_xid, record, request_span, LogTag};
use crate::{CacheGateError, Result};

const WORKSPACE_SIZE: usize = 64 * 1024;
const HEADER_SLOTS: u16 = 64;

/// Process-wide shared state: one store, a director per configured backend, live config.
pub struct CacheGate {
    pub config: ConfigHandle,
    pub store: Arc<Stevedore>,
    pub directors: HashMap<String, Arc<Director>>,
}

impl CacheGate {
    #[must_use]
    pub fn new(config: ConfigHandle) -> Arc<Self> {
        let cfg = config.current();
        let directors = cfg
            .backends
            .iter()
            .map(|b| {
                // `via_resolve` (§4.2): look the named backend up among its siblings rather than
                // needing the fully-built `Director` map, which doesn't exist yet at this point.
                let dial_endpoint = b
                    .via
                    .as_ref()
                    .and_then(|via_name| cfg.backends.iter().find(|other| &other.name == via_name))
                    .map_or(b.endpoint, |via_cfg| via_cfg.endpoint);
                (b.name.clone(), Arc::new(Director::from_config(b, dial_endpoint)))
            })
            .collect();
        let store = Stevedore::with_capacity(cfg.limits.storage_capacity_bytes, cfg.limits.nuke_limit);
        Arc::new(Self { config, store: Arc::new(store), directors })
    }

    fn director_for(&self, cfg: &Config) -> Option<Arc<Director>> {
        cfg.backends.first().and_then(|b| self.directors.get(&b.name)).cloned()
    }

    /// Start every configured listener, each on its own accept loop task. Returns once all
    /// listeners are bound; the accept loops run until the process exits.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let cfg = self.config.current();
        let mut handles = Vec::new();
        for listener_cfg in cfg.listeners.clone() {
            let gate = Arc::clone(self);
            let tcp = TcpListener::bind(listener_cfg.addr).await?;
            info!(addr = %listener_cfg.addr, proto = ?listener_cfg.proto, "listening");
            handles.push(tokio::spawn(async move {
                accept_loop(gate, tcp, listener_cfg).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        Ok(())
    }
}

async fn accept_loop(gate: Arc<CacheGate>, tcp: TcpListener, listener_cfg: ListenerConfig) {
    loop {
        let (stream, peer) = match tcp.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let gate = Arc::clone(&gate);
        let listener_cfg = listener_cfg.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(gate, stream, peer, listener_cfg).await {
                record(LogTag::FetchError, &format!("connection {peer}: {e}"));
            }
        });
    }
}

async fn handle_connection(
    gate: Arc<CacheGate>,
    mut stream: TcpStream,
    peer: SocketAddr,
    listener_cfg: ListenerConfig,
) -> Result<()> {
    let client_addr = if listener_cfg.proxy_protocol {
        match proxy_listener::read_preamble(&mut stream, peer).await {
            Ok(proxied) => proxied.src,
            Err(e) => {
                record(LogTag::FetchError, &format!("proxy preamble from {peer}: {e}"));
                return Ok(());
            }
        }
    } else {
        peer
    };

    let mut peek = [0u8; CLIENT_PREFACE.len()];
    let n = peek_exact(&mut stream, &mut peek).await?;
    let use_h2 = match listener_cfg.proto {
        ListenerProto::Http2 => true,
        ListenerProto::Http1 => false,
        ListenerProto::Auto => n == peek.len() && peek == *CLIENT_PREFACE,
    };

    if use_h2 {
        if n == peek.len() && peek == *CLIENT_PREFACE {
            stream.read_exact(&mut [0u8; CLIENT_PREFACE.len()]).await?;
        }
        let (read_half, write_half) = stream.into_split();
        handle_h2_connection(gate, read_half, write_half, client_addr, None, None).await
    } else {
        handle_h1_connection(gate, stream, client_addr).await
    }
}

/// Peek up to `buf.len()` bytes without consuming them from the stream, so the caller can decide
/// HTTP/1 vs. HTTP/2 before either parser claims the bytes.
async fn peek_exact(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.peek(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled = filled.max(n),
            Err(e) => return Err(e),
        }
        if filled >= buf.len() {
            break;
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------------------------
// HTTP/1 path
// ---------------------------------------------------------------------------------------------

async fn handle_h1_connection(gate: Arc<CacheGate>, mut stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        let Some((req_end, keep_alive)) = read_h1_request(&mut stream, &mut buf).await? else {
            return Ok(());
        };
        let xid = next_xid();
        let span = request_span(xid);
        let _enter = span.enter();

        let mut ws = Workspace::new(WORKSPACE_SIZE);
        let head = &buf[..req_end];
        let mut req_msg = match http1::parse_request(&mut ws, head, HEADER_SLOTS as usize) {
            Ok((msg, _consumed)) => msg,
            Err(e) => {
                write_simple_error(&mut stream, 400, "Bad Request").await?;
                return Err(CacheGateError::Framing(e));
            }
        };

        if let Some(settings_b64) = req_msg.header(&ws, "http2-settings").map(str::to_string) {
            let wants_h2c = req_msg
                .header(&ws, "upgrade")
                .map(|v| v.to_ascii_lowercase().contains("h2c"))
                .unwrap_or(false);
            if wants_h2c {
                if let Ok(settings_payload) = URL_SAFE_NO_PAD.decode(settings_b64.as_bytes()) {
                    return upgrade_to_h2c(gate, stream, &mut ws, &req_msg, &buf, req_end, settings_payload, client_addr)
                        .await;
                }
            }
        }

        let remaining = &buf[req_end..];
        let (response, close_after) =
            match process_h1_request(&gate, &mut ws, &mut req_msg, remaining, &mut stream, client_addr).await {
                Ok(v) => v,
                Err(e) => {
                    record(LogTag::FetchError, &format!("xid={xid}: {e}"));
                    (encode_h1_error(502, "Bad Gateway"), true)
                }
            };
        stream.write_all(&response).await?;
        buf.drain(..req_end);

        if !keep_alive || close_after {
            return Ok(());
        }
    }
}

/// Complete an `h2c` upgrade (RFC 7540 §3.2): the request that carried `Upgrade: h2c` and
/// `HTTP2-Settings:` never gets re-sent as HEADERS frames, so it becomes stream 1 directly.
/// Bytes already read past the request head (`buf[req_end..]`) belong to whatever the client
/// sent right after the upgrade request and have to be replayed ahead of the live socket.
/// Only bodyless upgrade requests are supported, matching this crate's HTTP/2 path, which has no
/// request-body handling at all yet (see DESIGN.md).
async fn upgrade_to_h2c(
    gate: Arc<CacheGate>,
    stream: TcpStream,
    ws: &mut Workspace,
    req: &HttpMsg,
    buf: &[u8],
    req_end: usize,
    settings_payload: Vec<u8>,
    client_addr: SocketAddr,
) -> Result<()> {
    let method = req.method(ws).unwrap_or("GET").to_string();
    let path = req.url(ws).unwrap_or("/").to_string();
    let headers: Vec<(String, String)> = req.iter(ws).map(|(n, v)| (n.to_string(), v.to_string())).collect();
    let seed = H2Request { stream_id: 1, method, path, scheme: "http".to_string(), headers };
    let leftover = buf[req_end..].to_vec();

    let mut stream = stream;
    stream
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")
        .await?;
    let (read_half, write_half) = stream.into_split();
    let chained = std::io::Cursor::new(leftover).chain(read_half);
    handle_h2_connection(gate, chained, write_half, client_addr, Some(seed), Some(settings_payload)).await
}

/// Accumulate bytes from `stream` into `buf` until a full request head is present, returning the
/// offset of the byte past the terminating CRLFCRLF and whether the client asked to keep the
/// connection alive. Returns `None` on a clean EOF between requests.
async fn read_h1_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Option<(usize, bool)>> {
    loop {
        if let Some(pos) = find_double_crlf(buf) {
            let keep_alive = !head_has_connection_close(&buf[..pos]);
            return Ok(Some((pos, keep_alive)));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() { Ok(None) } else { Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated request").into()) };
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 256 * 1024 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large").into());
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn head_has_connection_close(head: &[u8]) -> bool {
    std::str::from_utf8(head)
        .ok()
        .map(|s| s.to_ascii_lowercase().contains("connection: close"))
        .unwrap_or(false)
}

async fn process_h1_request(
    gate: &Arc<CacheGate>,
    ws: &mut Workspace,
    req: &mut HttpMsg,
    remaining_after_head: &[u8],
    stream: &mut TcpStream,
    client_addr: SocketAddr,
) -> Result<(Vec<u8>, bool)> {
    let cfg = gate.config.current();
    let method = req.method(ws).unwrap_or("GET").to_string();
    let url = req.url(ws).unwrap_or("/").to_string();
    let host = req.header(ws, "host").unwrap_or("").to_string();
    let accepts_gzip = req
        .header(ws, "accept-encoding")
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    let range_header = req.header(ws, "range").map(str::to_string);

    let key = ObjectKey::digest(&method, &host, &url);
    let header_snapshot: Vec<(String, String)> = req.iter(ws).map(|(n, v)| (n.to_string(), v.to_string())).collect();
    let lookup = |name: &str| -> Option<Cow<'_, str>> {
        header_snapshot
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| Cow::Owned(v.clone()))
    };

    let cached = gate.store.getattr(&key, lookup, accepts_gzip);
    let obj = match cached {
        Some(obj) if !obj.flags.contains(ObjFlags::HIT_FOR_MISS) && !obj.is_expired(SystemTime::now()) => {
            obj.record_hit();
            obj
        }
        _ => fetch_and_store(gate, &cfg, ws, req, &key, client_addr).await?,
    };

    let body = deliver_body(gate, &cfg, &obj, &range_header, accepts_gzip, client_addr).await?;
    let response = encode_h1_success(&obj, &body);
    Ok((response, false))
}

async fn fetch_and_store(
    gate: &Arc<CacheGate>,
    cfg: &Config,
    ws: &Workspace,
    req: &HttpMsg,
    key: &ObjectKey,
    client_addr: SocketAddr,
) -> Result<Arc<ObjectCore>> {
    let director = gate
        .director_for(cfg)
        .ok_or_else(|| CacheGateError::ConfigRuleFailure("no backend configured".into()))?;

    let boc = Arc::new(Boc::new());
    let (head, pfd) = director.gethdrs(ws, req, None, Some(client_addr)).await?;

    let mut resp_ws = Workspace::new(WORKSPACE_SIZE);
    let (resp, _) = http1::parse_response(&mut resp_ws, &head, HEADER_SLOTS as usize)
        .map_err(CacheGateError::Framing)?;
    let status = resp.status(&resp_ws).unwrap_or(502);
    record(LogTag::Debug, &format!("backend {} responded {status}", director.name));
    let content_encoding_gzip = resp
        .header(&resp_ws, "content-encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let framing = http1::determine_framing(&resp, &resp_ws)
        .map_err(CacheGateError::Framing)?;

    boc.advance(BocState::PrepStream);
    let raw_body = read_backend_body(&pfd, &director, framing).await?;
    boc.advance(BocState::Stream);

    let vary_header = resp.header(&resp_ws, "vary").map(str::to_string);
    let vary_entries = match &vary_header {
        Some(vh) => {
            let req_lookup = |name: &str| -> Option<Cow<'_, str>> { req.header(ws, name).map(Cow::Borrowed) };
            vary::build(vh, req_lookup).map_err(|e| CacheGateError::ConfigRuleFailure(e.to_string()))?
        }
        None => Vec::new(),
    };

    #[cfg(feature = "key-matcher")]
    let key_entries = {
        let key_header = resp.header(&resp_ws, "key").map(str::to_string);
        match &key_header {
            Some(kh) => {
                let req_lookup = |name: &str| -> Option<Cow<'_, str>> { req.header(ws, name).map(Cow::Borrowed) };
                cachegate_core::key::build(kh, req_lookup).map_err(|e| CacheGateError::ConfigRuleFailure(e.to_string()))?
            }
            None => Vec::new(),
        }
    };
    #[cfg(not(feature = "key-matcher"))]
    let key_entries = Vec::new();

    let disposition = FetchDisposition {
        do_gzip: cfg.defaults.do_gzip,
        do_gunzip: cfg.defaults.do_gunzip,
        do_esi: cfg.defaults.do_esi,
        is_gzip: content_encoding_gzip,
        has_body: !raw_body.is_empty(),
    };
    let stages = filter::resolve_fetch_list(&disposition);
    let has_esi = stages.iter().any(|s| matches!(s, FetchStage::Esi | FetchStage::EsiGzip));

    // The ESI program's Verbatim/Skip offsets are computed against whatever bytes
    // EsiParseFilter actually scans — which, when Gunzip precedes it in the chain, is the
    // inflated body, not the raw wire bytes. Run that prefix separately so the same bytes can
    // be kept as `esi_backing` instead of the pre-gunzip raw body.
    let (body, esi_backing) = if has_esi {
        let mut pre_chain = Chain::new();
        if stages.contains(&FetchStage::Gunzip) {
            pre_chain.push_stage(Box::new(GunzipFilter::new()));
        }
        let (pre, _) = pre_chain.process(Action::End, &raw_body)?;
        let pre_tail = pre_chain.finish()?;
        let mut backing = pre.to_vec();
        backing.extend_from_slice(&pre_tail);

        let mut esi_chain = Chain::new();
        esi_chain.push_stage(Box::new(EsiParseFilter::new(content_encoding_gzip)));
        let (program, _) = esi_chain.process(Action::End, &backing)?;
        let program_tail = esi_chain.finish()?;
        let mut program_bytes = program.to_vec();
        program_bytes.extend_from_slice(&program_tail);
        (program_bytes, Some(Bytes::from(backing)))
    } else {
        let mut chain = Chain::new();
        for stage in &stages {
            chain.push_stage(match stage {
                FetchStage::Gunzip => Box::new(GunzipFilter::new()),
                FetchStage::Gzip => Box::new(GzipFilter::new()),
                FetchStage::TestGunzip => Box::new(TestGunzipFilter::new()),
                FetchStage::Esi | FetchStage::EsiGzip => unreachable!("handled in the has_esi branch above"),
            });
        }
        let (processed, _) = chain.process(Action::End, &raw_body)?;
        let tail = chain.finish()?;
        let mut body = processed.to_vec();
        body.extend_from_slice(&tail);
        (body, None)
    };

    director.finish(pfd, framing == BodyFraming::CloseDelimited);
    boc.advance(BocState::Finished);

    // `beresp.uncacheable` (Cache-Control: private/no-store): stored as a hit-for-miss
    // placeholder rather than a real cached body, so concurrent requests for the same key find
    // something ("don't bother re-fetching the full response") without the response itself ever
    // being served as a hit.
    let cache_control = resp.header(&resp_ws, "cache-control").unwrap_or("").to_ascii_lowercase();
    let uncacheable = cache_control.split(',').map(str::trim).any(|d| d == "private" || d == "no-store");

    let mut flags = ObjFlags::empty();
    if content_encoding_gzip && !stages.contains(&FetchStage::Gunzip) {
        flags |= ObjFlags::GZIPED;
    }
    if has_esi {
        flags |= ObjFlags::ESI_PROGRAM;
    }
    if uncacheable {
        flags |= ObjFlags::HIT_FOR_MISS;
    }

    let obj = ObjectCore {
        t_origin: SystemTime::now(),
        ttl: if uncacheable { Duration::from_secs(2) } else { resolve_ttl(&resp, &resp_ws) },
        grace: Duration::from_secs(10),
        keep: Duration::from_secs(0),
        flags,
        hits: std::sync::atomic::AtomicU64::new(0),
        boc: Some(boc),
        vary: vary_entries,
        key_entries,
        headers: resp.encode(&resp_ws),
        body: Bytes::from(body),
        esi_backing,
    };

    if uncacheable {
        // `setattr` replaces the key's variant list wholesale instead of appending, so repeated
        // uncacheable fetches against the same key refresh one placeholder rather than piling up
        // a new variant (and a fresh capacity charge) every time.
        let obj = Arc::new(obj);
        gate.store.setattr(key.clone(), vec![Arc::clone(&obj)]);
        Ok(obj)
    } else {
        Ok(gate.store.allocobj(key.clone(), obj)?)
    }
}

fn resolve_ttl(resp: &HttpMsg, ws: &Workspace) -> Duration {
    if let Some(cc) = resp.header(ws, "cache-control") {
        for directive in cc.split(',') {
            let directive = directive.trim();
            if let Some(secs) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = secs.parse::<u64>() {
                    return Duration::from_secs(secs);
                }
            }
        }
    }
    Duration::from_secs(120)
}

async fn read_backend_body(
    pfd: &Arc<crate::backend::pool::Pfd>,
    _director: &Arc<Director>,
    framing: BodyFraming,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match framing {
        BodyFraming::None => {}
        BodyFraming::ContentLength(len) => {
            let mut remaining = len;
            while remaining > 0 {
                let mut chunk = [0u8; 8192];
                let n = read_some(pfd, &mut chunk[..remaining.min(8192) as usize]).await?;
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&chunk[..n]);
                remaining -= n as u64;
            }
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            loop {
                let mut chunk = [0u8; 8192];
                let n = read_some(pfd, &mut chunk).await?;
                if n == 0 {
                    break;
                }
                let (decoded, _consumed) = decoder.feed(&chunk[..n]).map_err(CacheGateError::Framing)?;
                out.extend_from_slice(&decoded);
            }
        }
        BodyFraming::CloseDelimited => loop {
            let mut chunk = [0u8; 8192];
            let n = read_some(pfd, &mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        },
    }
    Ok(out)
}

async fn read_some(pfd: &Arc<crate::backend::pool::Pfd>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        {
            let mut guard = pfd.stream.lock();
            if let Some(stream) = guard.as_mut() {
                match stream.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            } else {
                return Ok(0);
            }
        }
        let readable = {
            let guard = pfd.stream.lock();
            match guard.as_ref() {
                Some(s) => s.readable().await.is_ok(),
                None => false,
            }
        };
        if !readable {
            return Ok(0);
        }
    }
}

async fn deliver_body(
    gate: &Arc<CacheGate>,
    cfg: &Config,
    obj: &Arc<ObjectCore>,
    range_header: &Option<String>,
    accepts_gzip: bool,
    client_addr: SocketAddr,
) -> Result<Bytes> {
    let has_esi_data = obj.flags.contains(ObjFlags::ESI_PROGRAM);
    let disposition = DeliverDisposition {
        has_esi_data,
        esi_enabled: cfg.defaults.do_esi,
        is_gzip: obj.flags.contains(ObjFlags::GZIPED),
        client_accepts_gzip: accepts_gzip,
        status_is_200: true,
        request_has_range: range_header.is_some(),
    };
    let stages = filter::resolve_deliver_list(&disposition);

    let mut body = obj.body.clone();
    for stage in &stages {
        match stage {
            DeliverStage::Esi => {
                let max_depth = cfg.limits.max_esi_depth;
                let fetcher = make_include_fetcher(Arc::clone(gate), client_addr, max_depth);
                let backing = obj.esi_backing.clone().unwrap_or_default();
                body = deliver(&body, &backing, max_depth, &fetcher)
                    .await
                    .map_err(|e| CacheGateError::ConfigRuleFailure(e.to_string()))?;
            }
            DeliverStage::Gunzip => {
                let mut chain = Chain::new();
                chain.push_stage(Box::new(GunzipFilter::new()));
                let (out, _) = chain.process(Action::End, &body)?;
                body = out;
            }
            DeliverStage::Range => {
                if let Some(range) = range_header {
                    if let Some(r) = crate::filter::range::parse_range(range, body.len() as u64) {
                        let (sliced, _content_range) = crate::filter::range::apply_range(&body, r);
                        body = Bytes::from(sliced);
                    }
                }
            }
        }
    }
    Ok(body)
}

/// Build the `esi:include` fetcher (§4.4.2/§4.4.3): a cache hit serves straight from the store,
/// a miss runs a real sub-request through `fetch_and_store` against the include's director,
/// exactly as a top-level request would. `'static` throughout since every capture is owned.
fn make_include_fetcher(gate: Arc<CacheGate>, client_addr: SocketAddr, max_depth: u32) -> Box<IncludeFetcher<'static>> {
    Box::new(move |src: &str, host: Option<&str>| {
        let gate = Arc::clone(&gate);
        let src = src.to_string();
        let host = host.map(str::to_string);
        Box::pin(async move {
            let host_ref = host.as_deref().unwrap_or("");
            let sub_key = ObjectKey::digest("GET", host_ref, &src);
            let sub_obj = match gate.store.getattr(&sub_key, |_| None, false) {
                Some(obj) if !obj.flags.contains(ObjFlags::HIT_FOR_MISS) && !obj.is_expired(SystemTime::now()) => {
                    obj.record_hit();
                    obj
                }
                _ => {
                    let cfg = gate.config.current();
                    let mut ws = Workspace::new(WORKSPACE_SIZE);
                    let mut bereq = HttpMsg::new(MsgKind::Request, HEADER_SLOTS);
                    bereq
                        .set_request_line(&mut ws, "GET", &src, "HTTP/1.1")
                        .map_err(|e| e.to_string())?;
                    if !host_ref.is_empty() {
                        bereq.set_header(&mut ws, "host", host_ref).map_err(|e| e.to_string())?;
                    }
                    fetch_and_store(&gate, &cfg, &ws, &bereq, &sub_key, client_addr)
                        .await
                        .map_err(|e| e.to_string())?
                }
            };
            render_include_body(&gate, &sub_obj, client_addr, max_depth).await
        })
    })
}

/// Render a fetched include target into plain splice-ready bytes: if the fragment itself
/// carries a compiled ESI program, interpret it inline (`run_inline`, never re-wrapping gzip
/// framing of its own) so nested includes resolve the same way; otherwise the body is final
/// already.
fn render_include_body<'a>(
    gate: &'a Arc<CacheGate>,
    obj: &'a Arc<ObjectCore>,
    client_addr: SocketAddr,
    max_depth: u32,
) -> Pin<Box<dyn Future<Output = std::result::Result<(Bytes, bool), String>> + Send + 'a>> {
    Box::pin(async move {
        if !obj.flags.contains(ObjFlags::ESI_PROGRAM) {
            return Ok((obj.body.clone(), obj.flags.contains(ObjFlags::GZIPED)));
        }
        let backing = obj.esi_backing.clone().unwrap_or_default();
        let fetcher = make_include_fetcher(Arc::clone(gate), client_addr, max_depth);
        let rendered = crate::esi::deliver::deliver_inline(&obj.body, &backing, max_depth, &fetcher)
            .await
            .map_err(|e| e.to_string())?;
        Ok((rendered, false))
    })
}

fn encode_h1_success(obj: &Arc<ObjectCore>, body: &Bytes) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(format!("Age: {}\r\n", obj.age(SystemTime::now()).as_secs()).as_bytes());
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out.extend_from_slice(body);
    out
}

fn encode_h1_error(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("{status} {reason}");
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

async fn write_simple_error(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    stream.write_all(&encode_h1_error(status, reason)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// HTTP/2 path
// ---------------------------------------------------------------------------------------------

type H2Writer = Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>;

async fn handle_h2_connection<R>(
    gate: Arc<CacheGate>,
    read_half: R,
    write_half: tokio::net::tcp::OwnedWriteHalf,
    client_addr: SocketAddr,
    seed_request: Option<H2Request>,
    upgrade_settings_payload: Option<Vec<u8>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let session = Arc::new(Session::new(4096, 16 * 1024));
    let writer: H2Writer = Arc::new(tokio::sync::Mutex::new(write_half));

    if let Some(payload) = upgrade_settings_payload {
        session.apply_upgrade_settings(&payload).await;
    }
    if let Some(req) = seed_request {
        session.seed_upgrade_request(req).await;
    }

    let recv_session = Arc::clone(&session);
    let receiver = tokio::spawn(async move {
        if let Err(e) = recv_session.run_receiver(read_half).await {
            record(LogTag::FetchError, &format!("h2 connection from {client_addr}: {e}"));
        }
    });

    // Polls each odd stream id for a fully-decoded request. A real deployment would have
    // `Session` push newly-ready stream ids through a channel; this sweep is the simple
    // stand-in while that richer wake-up path isn't built out (see DESIGN.md).
    let mut seen_streams = std::collections::HashSet::new();
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if receiver.is_finished() {
            break;
        }
        for (stream_id, error_code) in session.take_pending_resets().await {
            let wire = frame::encode_rst_stream(stream_id, error_code);
            if writer.lock().await.write_all(&wire).await.is_err() {
                break;
            }
        }
        for stream_id in (1u32..).step_by(2).take(64) {
            if seen_streams.contains(&stream_id) {
                continue;
            }
            if let Some(req) = session.try_take_request(stream_id).await {
                seen_streams.insert(stream_id);
                let gate = Arc::clone(&gate);
                let session = Arc::clone(&session);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    if let Err(e) = serve_h2_stream(gate, &session, req, client_addr, &writer).await {
                        record(LogTag::FetchError, &format!("h2 stream {stream_id}: {e}"));
                    }
                });
            }
        }
    }
    session.stop().await;
    let _ = writer.lock().await.shutdown().await;
    Ok(())
}

async fn serve_h2_stream(
    gate: Arc<CacheGate>,
    session: &Session,
    req: H2Request,
    client_addr: SocketAddr,
    writer: &H2Writer,
) -> Result<()> {
    let cfg = gate.config.current();
    let host = req.headers.iter().find(|(n, _)| n == "host").map(|(_, v)| v.clone()).unwrap_or_default();

    let key = ObjectKey::digest(&req.method, &host, &req.path);
    let lookup = |name: &str| -> Option<Cow<'_, str>> {
        req.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| Cow::Owned(v.clone()))
    };
    let accepts_gzip = req
        .headers
        .iter()
        .find(|(n, _)| n == "accept-encoding")
        .map(|(_, v)| v.contains("gzip"))
        .unwrap_or(false);

    let obj = match gate.store.getattr(&key, lookup, accepts_gzip) {
        Some(obj) if !obj.flags.contains(ObjFlags::HIT_FOR_MISS) && !obj.is_expired(SystemTime::now()) => {
            obj.record_hit();
            obj
        }
        _ => {
            let mut ws = Workspace::new(WORKSPACE_SIZE);
            let mut bereq = HttpMsg::new(MsgKind::Request, HEADER_SLOTS);
            bereq.set_request_line(&mut ws, &req.method, &req.path, "HTTP/1.1")?;
            for (name, value) in &req.headers {
                bereq.set_header(&mut ws, name, value)?;
            }
            fetch_and_store(&gate, &cfg, &ws, &bereq, &key, client_addr).await?
        }
    };

    let body = deliver_body(&gate, &cfg, &obj, &None, accepts_gzip, client_addr).await?;
    write_h2_response(session, req.stream_id, &body, writer).await
}

async fn write_h2_response(session: &Session, stream_id: u32, body: &Bytes, writer: &H2Writer) -> Result<()> {
    let mut header_block = Vec::new();
    header_block.push(0x88); // indexed :status 200
    encode_literal_without_indexing(&mut header_block, "content-length", &body.len().to_string());

    let mut wire = frame::encode_header(0x1, FrameFlags::END_HEADERS, stream_id, header_block.len() as u32).to_vec();
    wire.extend_from_slice(&header_block);
    wire.extend_from_slice(&frame::encode_header(0x0, FrameFlags::END_STREAM, stream_id, body.len() as u32));
    wire.extend_from_slice(body);

    session.on_data_sent(stream_id, body.len()).await;
    writer.lock().await.write_all(&wire).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_crlf_finds_head_boundary() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        assert_eq!(find_double_crlf(buf), Some(28));
    }

    #[test]
    fn connection_close_detected_case_insensitively() {
        assert!(head_has_connection_close(b"GET / HTTP/1.1\r\nConnection: Close\r\n\r\n"));
        assert!(!head_has_connection_close(b"GET / HTTP/1.1\r\n\r\n"));
    }
}
