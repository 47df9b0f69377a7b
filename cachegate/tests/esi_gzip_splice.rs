//! End-to-end check of §8's ESI gzip splice scenario against a real (fake) backend: a parent
//! response gzip-encodes `AAA<esi:include src="/c"/>BBB`, the child `/c` gzip-encodes `CCC`, and
//! the client should see a single valid gzip member that inflates to `AAACCCBBB`.
use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cachegate::config::ConfigHandle;
use cachegate::server::CacheGate;

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).unwrap();
    enc.finish().unwrap()
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut dec = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut dec, &mut out).unwrap();
    out
}

/// Serve one canned gzip response per request line, keyed by path, for as many requests as a
/// connection sends before it's dropped. Mirrors a real origin closely enough to exercise the
/// director's connect/send/recv/recycle path rather than a hand-fed fixture.
async fn run_fake_backend(listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        tokio::spawn(async move {
            let mut buf = Vec::new();
            loop {
                let head_end = loop {
                    if let Some(pos) = find_header_end(&buf) {
                        break pos;
                    }
                    let mut chunk = [0u8; 1024];
                    match stream.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => return,
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                buf.drain(..head_end + 4);
                let path = head.lines().next().and_then(|l| l.split_whitespace().nth(1)).unwrap_or("/").to_string();

                let plain: &[u8] = if path == "/c" { b"CCC" } else { b"AAA<esi:include src=\"/c\"/>BBB" };
                let body = gzip(plain);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Encoding: gzip\r\nConnection: keep-alive\r\n\r\n",
                    body.len()
                );
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                if stream.write_all(&body).await.is_err() {
                    return;
                }
            }
        });
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_h1_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if response_body_complete(&buf) {
                    break;
                }
            }
            Ok(Err(_)) => break,
        }
    }
    buf
}

fn response_body_complete(buf: &[u8]) -> bool {
    let Some(head_end) = find_header_end(buf) else { return false };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let Some(len) = head.lines().find_map(|l| l.strip_prefix("Content-Length: ")) else { return false };
    let Ok(len) = len.trim().parse::<usize>() else { return false };
    buf.len() >= head_end + 4 + len
}

fn split_body(buf: &[u8]) -> Vec<u8> {
    let head_end = find_header_end(buf).expect("response has a header terminator");
    buf[head_end + 4..].to_vec()
}

#[tokio::test]
async fn esi_include_splices_through_gzip() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(run_fake_backend(backend_listener));

    let gate_addr = "127.0.0.1:18281";
    let config_yaml = format!(
        "listeners:\n  - addr: \"{gate_addr}\"\n    proto: http1\nbackends:\n  - name: origin\n    endpoint: \"{backend_addr}\"\ndefaults:\n  do_esi: true\n"
    );
    let config_path = std::env::temp_dir().join(format!("cachegate-esi-splice-{}.yaml", std::process::id()));
    std::fs::write(&config_path, config_yaml).unwrap();

    let config = ConfigHandle::load(config_path).unwrap();
    let gate = CacheGate::new(config);
    tokio::spawn({
        let gate = gate.clone();
        async move {
            let _ = gate.run().await;
        }
    });

    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(gate_addr).await.unwrap();
    client
        .write_all(b"GET /esi HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let response = read_h1_response(&mut client).await;
    let body = split_body(&response);
    assert_eq!(gunzip(&body), b"AAACCCBBB");
}
