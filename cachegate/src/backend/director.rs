//! Backend director (VBE, §4.2): the glue between a configured backend and its connection pool.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachegate_core::http::HttpMsg;
use cachegate_core::proxy;
use cachegate_core::workspace::Workspace;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::{BackendConfig, ProxyHeaderVersion};
use crate::vsl::{record, LogTag};

use super::connwait::{wait_until, WaitQueue};
use super::pool::{ConnPool, PfdState};
use super::BeError;

pub struct DirectorCounters {
    pub unhealthy: AtomicU32,
    pub busy: AtomicU32,
    pub fetch_fail: AtomicU32,
}

impl Default for DirectorCounters {
    fn default() -> Self {
        Self { unhealthy: AtomicU32::new(0), busy: AtomicU32::new(0), fetch_fail: AtomicU32::new(0) }
    }
}

/// The glue between a configured backend and its pool (§4.2).
pub struct Director {
    pub name: String,
    pub endpoint: SocketAddr,
    /// `via` (§4.2): the name of the backend this one chains through, if configured.
    pub via: Option<String>,
    pub host_header: Option<String>,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub between_bytes_timeout: Duration,
    pub max_connections: u32,
    pub backend_wait_limit: u32,
    pub backend_wait_timeout: Duration,
    pub proxy_header: Option<ProxyHeaderVersion>,
    pub sick: AtomicBool,
    pub counters: DirectorCounters,
    pool: Arc<ConnPool>,
    wait_queue: AsyncMutex<WaitQueue>,
}

impl Director {
    /// `dial_endpoint` is the address the pool actually connects to: `cfg.endpoint` normally, or
    /// the resolved via-backend's endpoint when `cfg.via` names one (§4.2 `via_resolve`). The
    /// caller resolves the name against the rest of the configured backends since a `Director`
    /// only ever owns its own config.
    #[must_use]
    pub fn from_config(cfg: &BackendConfig, dial_endpoint: SocketAddr) -> Self {
        Self {
            name: cfg.name.clone(),
            endpoint: cfg.endpoint,
            via: cfg.via.clone(),
            host_header: cfg.host_header.clone(),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            first_byte_timeout: Duration::from_millis(cfg.first_byte_timeout_ms),
            between_bytes_timeout: Duration::from_millis(cfg.between_bytes_timeout_ms),
            max_connections: cfg.max_connections,
            backend_wait_limit: cfg.backend_wait_limit,
            backend_wait_timeout: Duration::from_millis(cfg.backend_wait_timeout_ms),
            proxy_header: cfg.proxy_header,
            sick: AtomicBool::new(false),
            counters: DirectorCounters::default(),
            pool: ConnPool::new(
                dial_endpoint,
                Duration::from_millis(cfg.local_error_holddown_ms),
                Duration::from_millis(cfg.remote_error_holddown_ms),
            ),
            wait_queue: AsyncMutex::new(WaitQueue::new()),
        }
    }

    #[must_use]
    pub fn healthy(&self) -> bool {
        !self.sick.load(Ordering::Relaxed)
    }

    /// `via_resolve`: the name of the backend this one chains through, if any (§4.2).
    #[must_use]
    pub fn via_resolve(&self) -> Option<&str> {
        self.via.as_deref()
    }

    /// `via_endpoint`: the address actually dialed for this director - the via-backend's
    /// endpoint when chained, this director's own `endpoint` otherwise (§4.2). The pool was
    /// already pointed here at construction time; this just exposes it for inspection/logging.
    #[must_use]
    pub fn via_endpoint(&self) -> SocketAddr {
        self.pool.endpoint()
    }

    /// `get_fd(ctx, worker, director, backend, force_fresh)` (§4.2 steps 1-8, minus the htc
    /// workspace reservation, which is the caller's responsibility before calling in).
    pub async fn get_fd(
        self: &Arc<Self>,
        force_fresh: bool,
        client_addr: Option<SocketAddr>,
    ) -> Result<Arc<super::pool::Pfd>, BeError> {
        if !self.healthy() {
            self.counters.unhealthy.fetch_add(1, Ordering::Relaxed);
            return Err(BeError::Unhealthy(self.name.clone()));
        }

        let mut queued_notify = None;
        if self.pool.n_conn() >= self.max_connections {
            if self.backend_wait_limit > 0 && !self.backend_wait_timeout.is_zero() {
                let notify = {
                    let mut q = self.wait_queue.lock().await;
                    if q.len() as u32 >= self.backend_wait_limit {
                        None
                    } else {
                        Some(q.enqueue())
                    }
                };
                if let Some(notify) = notify {
                    let woken = wait_until(&notify, self.backend_wait_timeout).await;
                    queued_notify = Some(notify);
                    if !woken || self.pool.n_conn() >= self.max_connections {
                        self.counters.busy.fetch_add(1, Ordering::Relaxed);
                        record(LogTag::FetchError, &format!("backend {}: busy", self.name));
                        if let Some(n) = &queued_notify {
                            self.wait_queue.lock().await.remove(n);
                        }
                        return Err(BeError::Busy(self.name.clone()));
                    }
                } else {
                    self.counters.busy.fetch_add(1, Ordering::Relaxed);
                    return Err(BeError::Busy(self.name.clone()));
                }
            } else {
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                return Err(BeError::Busy(self.name.clone()));
            }
        }

        let pfd = match self.pool.get(self.connect_timeout, force_fresh).await {
            Ok(pfd) => pfd,
            Err(e) => {
                self.counters.fetch_fail.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if *pfd.state.lock() == PfdState::Stolen {
            self.pool.wait(&pfd, self.first_byte_timeout).await?;
        }

        // A via-chained backend always gets a v2 preamble regardless of `proxy_header`: the
        // via-backend has to learn the real client address and the original target endpoint
        // (wrapped in as the preamble's "dst") from somewhere, since the pool dialed the
        // via-backend's address instead (§4.2 `via_resolve`/`via_endpoint`).
        let proxy_version = self.proxy_header.or(self.via.is_some().then_some(ProxyHeaderVersion::V2));
        if let Some(version) = proxy_version {
            if let Some(client) = client_addr {
                self.emit_proxy_preamble(&pfd, version, client).await?;
            }
        }

        if self.pool.n_conn() < self.max_connections {
            self.wait_queue.lock().await.wake_next();
        }

        Ok(pfd)
    }

    async fn emit_proxy_preamble(
        &self,
        pfd: &Arc<super::pool::Pfd>,
        version: ProxyHeaderVersion,
        client_addr: SocketAddr,
    ) -> Result<(), BeError> {
        let buf = match version {
            ProxyHeaderVersion::V1 => proxy::encode_v1(client_addr, self.endpoint),
            ProxyHeaderVersion::V2 => proxy::encode_v2(client_addr, self.endpoint, &[]),
        };
        // SAFETY-free: this is a synchronous write attempt via try_write, acceptable because the
        // preamble is tiny and immediately follows a fresh/recycled connect.
        loop {
            let mut guard = pfd.stream.lock();
            let Some(stream) = guard.as_mut() else {
                return Err(BeError::ConnectFailed(self.name.clone(), "connection closed before PROXY preamble".into()));
            };
            match stream.try_write(&buf) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    drop(guard);
                    let ready = stream_writable(pfd).await;
                    if !ready {
                        return Err(BeError::ConnectFailed(self.name.clone(), "PROXY preamble write failed".into()));
                    }
                }
                Err(e) => {
                    return Err(BeError::ConnectFailed(self.name.clone(), e.to_string()));
                }
            }
        }
    }

    /// `gethdrs`: send `bereq` and parse the response status/headers, retrying once on a
    /// recycled connection that was closed early (§4.2, §7 kind 7, §8 scenario 6).
    pub async fn gethdrs(
        self: &Arc<Self>,
        ws: &Workspace,
        bereq: &HttpMsg,
        body: Option<&[u8]>,
        client_addr: Option<SocketAddr>,
    ) -> Result<(Vec<u8>, Arc<super::pool::Pfd>), BeError> {
        let body_already_sent = body.is_some();
        let mut extrachance = true;
        loop {
            let force_fresh = !extrachance;
            let pfd = self.get_fd(force_fresh, client_addr).await?;

            let wire = encode_request_line(ws, bereq, self.host_header.as_deref());
            let send_result = write_all_pfd(&pfd, &wire, body).await;
            if send_result.is_err() {
                if extrachance && !body_already_sent {
                    self.pool.close(&pfd);
                    extrachance = false;
                    continue;
                }
                self.pool.close(&pfd);
                return Err(BeError::ConnectFailed(self.name.clone(), "send failed".into()));
            }

            match tokio::time::timeout(self.first_byte_timeout, read_response_head(&pfd)).await {
                Ok(Ok(head)) => return Ok((head, pfd)),
                Ok(Err(_)) | Err(_) => {
                    if extrachance && !body_already_sent {
                        self.pool.close(&pfd);
                        extrachance = false;
                        continue;
                    }
                    self.pool.close(&pfd);
                    return Err(BeError::ResponseTimeout(self.name.clone()));
                }
            }
        }
    }

    /// `finish`: recycle or close based on whether the response asked for connection close.
    pub fn finish(&self, pfd: Arc<super::pool::Pfd>, doclose: bool) {
        if doclose || self.proxy_header.is_some() || self.via.is_some() {
            self.pool.close(&pfd);
        } else {
            self.pool.recycle(pfd);
        }
        self.wait_queue.try_lock().map(|mut q| q.wake_next()).ok();
    }

    /// Raw byte shuttle between a client stream and the backend fd, for WebSocket-like upgrades.
    pub async fn http1pipe(
        &self,
        pfd: &Arc<super::pool::Pfd>,
        client: &mut (impl AsyncRead + AsyncWrite + Unpin),
        deadline: Duration,
    ) -> std::io::Result<()> {
        let mut guard = pfd.stream.lock();
        let Some(backend) = guard.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "pfd closed"));
        };
        tokio::time::timeout(deadline, tokio::io::copy_bidirectional(client, backend))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "http1pipe deadline"))??;
        Ok(())
    }
}

async fn stream_writable(pfd: &Arc<super::pool::Pfd>) -> bool {
    let guard = pfd.stream.lock();
    match guard.as_ref() {
        Some(stream) => stream.writable().await.is_ok(),
        None => false,
    }
}

async fn write_all_pfd(pfd: &Arc<super::pool::Pfd>, head: &[u8], body: Option<&[u8]>) -> std::io::Result<()> {
    let mut guard = pfd.stream.lock();
    let Some(stream) = guard.as_mut() else {
        return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "pfd closed"));
    };
    stream.try_write(head)?;
    if let Some(b) = body {
        stream.try_write(b)?;
    }
    Ok(())
}

async fn read_response_head(pfd: &Arc<super::pool::Pfd>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let mut chunk = [0u8; 4096];
        let n = stream_read_some(pfd, &mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed before headers"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            buf.truncate(pos);
            return Ok(buf);
        }
        if buf.len() > 64 * 1024 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "response headers too large"));
        }
    }
}

async fn stream_read_some(pfd: &Arc<super::pool::Pfd>, buf: &mut [u8]) -> std::io::Result<usize> {
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
        let ready = stream_readable(pfd).await;
        if !ready {
            return Ok(0);
        }
    }
}

async fn stream_readable(pfd: &Arc<super::pool::Pfd>) -> bool {
    let guard = pfd.stream.lock();
    match guard.as_ref() {
        Some(stream) => stream.readable().await.is_ok(),
        None => false,
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn encode_request_line(ws: &Workspace, bereq: &HttpMsg, host_override: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(bereq.method(ws).unwrap_or("GET").as_bytes());
    out.push(b' ');
    out.extend_from_slice(bereq.url(ws).unwrap_or("/").as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in bereq.iter(ws) {
        if name.eq_ignore_ascii_case("host") {
            if let Some(h) = host_override {
                out.extend_from_slice(format!("Host: {h}\r\n").as_bytes());
                continue;
            }
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[allow(dead_code)]
fn log_unhealthy(name: &str) {
    warn!(backend = name, "marked unhealthy");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_cfg(name: &str, endpoint: &str, via: Option<&str>) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            endpoint: endpoint.parse().unwrap(),
            host_header: None,
            connect_timeout_ms: 3_500,
            first_byte_timeout_ms: 60_000,
            between_bytes_timeout_ms: 60_000,
            max_connections: 10,
            backend_wait_limit: 0,
            backend_wait_timeout_ms: 0,
            proxy_header: None,
            local_error_holddown_ms: 1_000,
            remote_error_holddown_ms: 1_000,
            via: via.map(str::to_string),
        }
    }

    #[test]
    fn via_endpoint_dials_the_chained_backend_not_its_own() {
        let edge = backend_cfg("edge", "127.0.0.1:9001", None);
        let origin = backend_cfg("origin", "127.0.0.1:9002", Some("edge"));

        let edge_director = Director::from_config(&edge, edge.endpoint);
        let origin_director = Director::from_config(&origin, edge.endpoint);

        assert_eq!(origin_director.via_resolve(), Some("edge"));
        assert_eq!(origin_director.via_endpoint(), edge.endpoint);
        // The preamble still names the chained backend's own endpoint, not the one dialed.
        assert_eq!(origin_director.endpoint, origin.endpoint);
        assert_eq!(edge_director.via_resolve(), None);
        assert_eq!(edge_director.via_endpoint(), edge.endpoint);
    }

    #[test]
    fn via_chained_backend_forces_proxy_preamble_and_per_request_close() {
        let origin = backend_cfg("origin", "127.0.0.1:9003", Some("edge"));
        let director = Director::from_config(&origin, "127.0.0.1:9001".parse().unwrap());
        assert!(director.proxy_header.is_none());
        assert!(director.via.is_some());
    }
}
