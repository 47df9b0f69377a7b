//! PROXY protocol preamble detection (§4.6) on an accepted connection: peeks bytes off the socket
//! until the signature resolves, then hands back the real peer address plus whatever bytes were
//! consumed so the caller can feed the remainder straight into HTTP/1 or HTTP/2 parsing.
use std::net::SocketAddr;

use cachegate_core::proxy::{self, ProxyError, ProxyHeader};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum ProxyListenError {
    #[error("proxy protocol: {0}")]
    Proxy(#[from] ProxyError),
    #[error("i/o error reading proxy preamble: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before the proxy preamble completed")]
    Eof,
}

/// The effective peer address once PROXY is accounted for: `Local` preserves the TCP-observed
/// address (v2 LOCAL command, e.g. a health check from the load balancer itself).
pub struct ProxiedPeer {
    pub src: SocketAddr,
    pub dst: Option<SocketAddr>,
}

/// Read and strip a PROXY v1/v2 preamble off `io`, growing a scratch buffer one read at a time per
/// `completion_needed`'s guidance until the header is complete. `tcp_peer` is the address the
/// kernel reported; it's what we fall back to for `LOCAL` and is used as the base of `ProxiedPeer`.
pub async fn read_preamble<R: AsyncRead + Unpin>(
    mut io: R,
    tcp_peer: SocketAddr,
) -> Result<ProxiedPeer, ProxyListenError> {
    let mut buf = Vec::new();
    loop {
        match proxy::completion_needed(&buf) {
            Ok(None) => break,
            Ok(Some(need)) => {
                let start = buf.len();
                buf.resize(start + need, 0);
                let n = io.read(&mut buf[start..]).await?;
                if n == 0 {
                    return Err(ProxyListenError::Eof);
                }
                buf.truncate(start + n);
            }
            Err(e) => return Err(e.into()),
        }
    }
    match proxy::parse(&buf)? {
        ProxyHeader::Local => Ok(ProxiedPeer { src: tcp_peer, dst: None }),
        ProxyHeader::Proxied { src, dst, .. } => Ok(ProxiedPeer { src, dst: Some(dst) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachegate_core::proxy::encode_v1;

    #[tokio::test]
    async fn v1_preamble_yields_proxied_src() {
        let src: SocketAddr = "203.0.113.7:4433".parse().unwrap();
        let dst: SocketAddr = "203.0.113.1:443".parse().unwrap();
        let wire = encode_v1(src, dst);
        let tcp_peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();

        let result = read_preamble(std::io::Cursor::new(wire), tcp_peer).await.unwrap();
        assert_eq!(result.src, src);
        assert_eq!(result.dst, Some(dst));
    }

    #[tokio::test]
    async fn v2_local_falls_back_to_tcp_peer() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A]);
        wire.push(0x20); // version 2, command LOCAL
        wire.push(0x00);
        wire.extend_from_slice(&0u16.to_be_bytes());
        let tcp_peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();

        let result = read_preamble(std::io::Cursor::new(wire), tcp_peer).await.unwrap();
        assert_eq!(result.src, tcp_peer);
        assert!(result.dst.is_none());
    }

    #[tokio::test]
    async fn truncated_connection_is_eof() {
        let tcp_peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let result = read_preamble(std::io::Cursor::new(b"PRO".to_vec()), tcp_peer).await;
        assert!(matches!(result, Err(ProxyListenError::Eof)));
    }
}
