//! The HTTP message store: an ordered, bounded sequence of header fields plus three reserved
//! "pseudo" slots, all living as [`Span`]s into a [`Workspace`].
//!
//! This is the workspace-backed analogue of the teacher's `vcl::http::HTTP`, generalized from "a
//! wrapper around a C `struct http`" to an owned, allocation-disciplined message: slot 0/1/2 hold
//! the first line (method+url+proto for a request, proto+status+reason for a response), headers
//! start at [`HDR_FIRST`]. Capacity (`shd`) is fixed at construction; `nhd` never exceeds it.
use std::fmt;

use crate::workspace::{Span, Workspace, WsError};

/// Index of the first real header slot; 0..HDR_FIRST are the pseudo first-line slots.
pub const HDR_FIRST: u16 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MsgKind {
    Request,
    Response,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("no more header slots (capacity {0})")]
    NoMoreSlots(u16),
    #[error(transparent)]
    Workspace(#[from] WsError),
    #[error("malformed packed header block")]
    MalformedPacked,
    #[error("header name exceeds 127 bytes")]
    NameTooLong,
}

bitflags::bitflags! {
    /// Per-field flag byte, mirroring the teacher's `hdf` array (hop-by-hop / filtering marks).
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct HdrFlags: u8 {
        const HOP_BY_HOP = 0x01;
        const FILTERED   = 0x02;
    }
}

#[derive(Debug, Copy, Clone)]
struct HeaderField {
    span: Span,
    flags: HdrFlags,
}

/// A request or response message: first line + an ordered header list, all backed by spans into
/// a caller-supplied [`Workspace`].
pub struct HttpMsg {
    kind: MsgKind,
    shd: u16,
    first_line: [Span; 3],
    headers: Vec<HeaderField>,
}

impl HttpMsg {
    #[must_use]
    pub fn new(kind: MsgKind, shd: u16) -> Self {
        HttpMsg {
            kind,
            shd,
            first_line: [Span::EMPTY; 3],
            headers: Vec::with_capacity(shd as usize),
        }
    }

    #[must_use]
    pub fn kind(&self) -> MsgKind {
        self.kind
    }

    #[must_use]
    pub fn nhd(&self) -> u16 {
        self.headers.len() as u16
    }

    #[must_use]
    pub fn shd(&self) -> u16 {
        self.shd
    }

    pub fn set_request_line(
        &mut self,
        ws: &mut Workspace,
        method: &str,
        url: &str,
        proto: &str,
    ) -> Result<(), HttpError> {
        debug_assert_eq!(self.kind, MsgKind::Request);
        self.first_line[0] = ws.copy_str(method)?;
        self.first_line[1] = ws.copy_str(url)?;
        self.first_line[2] = ws.copy_str(proto)?;
        Ok(())
    }

    pub fn set_status_line(
        &mut self,
        ws: &mut Workspace,
        proto: &str,
        status: u16,
        reason: &str,
    ) -> Result<(), HttpError> {
        debug_assert_eq!(self.kind, MsgKind::Response);
        self.first_line[0] = ws.copy_str(proto)?;
        self.first_line[1] = ws.copy_str(&status.to_string())?;
        self.first_line[2] = ws.copy_str(reason)?;
        Ok(())
    }

    fn field<'w>(&self, ws: &'w Workspace, span: Span) -> Option<&'w str> {
        if span.is_empty() {
            None
        } else {
            Some(ws.get_str(span))
        }
    }

    pub fn method<'w>(&self, ws: &'w Workspace) -> Option<&'w str> {
        (self.kind == MsgKind::Request)
            .then_some(self.first_line[0])
            .and_then(|s| self.field(ws, s))
    }

    pub fn url<'w>(&self, ws: &'w Workspace) -> Option<&'w str> {
        (self.kind == MsgKind::Request)
            .then_some(self.first_line[1])
            .and_then(|s| self.field(ws, s))
    }

    pub fn proto<'w>(&self, ws: &'w Workspace) -> Option<&'w str> {
        self.field(ws, self.first_line[match self.kind {
            MsgKind::Request => 2,
            MsgKind::Response => 0,
        }])
    }

    pub fn status(&self, ws: &Workspace) -> Option<u16> {
        (self.kind == MsgKind::Response)
            .then_some(self.first_line[1])
            .and_then(|s| self.field(ws, s))
            .and_then(|s| s.parse().ok())
    }

    pub fn reason<'w>(&self, ws: &'w Workspace) -> Option<&'w str> {
        (self.kind == MsgKind::Response)
            .then_some(self.first_line[2])
            .and_then(|s| self.field(ws, s))
    }

    pub fn set_status(&mut self, ws: &mut Workspace, status: u16) -> Result<(), HttpError> {
        self.first_line[1] = ws.copy_str(&status.to_string())?;
        Ok(())
    }

    /// Append a header. Fails once capacity (`shd`) is reached, exactly like the teacher's
    /// `set_header`.
    pub fn set_header(
        &mut self,
        ws: &mut Workspace,
        name: &str,
        value: &str,
    ) -> Result<(), HttpError> {
        if self.headers.len() >= self.shd as usize {
            return Err(HttpError::NoMoreSlots(self.shd));
        }
        if name.len() > 127 {
            return Err(HttpError::NameTooLong);
        }
        let span = ws.copy_str(&format!("{name}: {value}"))?;
        self.headers.push(HeaderField {
            span,
            flags: if is_hop_by_hop(name) {
                HdrFlags::HOP_BY_HOP
            } else {
                HdrFlags::empty()
            },
        });
        Ok(())
    }

    /// Remove every header matching `name`, case-insensitively, preserving relative order of the
    /// rest (compaction, like the teacher's `unset_header`).
    pub fn unset_header(&mut self, ws: &Workspace, name: &str) {
        self.headers.retain(|hd| {
            let (n, _) = split_header(ws.get_str(hd.span));
            !n.eq_ignore_ascii_case(name)
        });
    }

    pub fn header<'w>(&self, ws: &'w Workspace, name: &str) -> Option<&'w str> {
        self.iter(ws).find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    pub fn header_all<'w>(&self, ws: &'w Workspace, name: &str) -> Vec<&'w str> {
        self.iter(ws)
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .collect()
    }

    pub fn iter<'a, 'w>(&'a self, ws: &'w Workspace) -> impl Iterator<Item = (&'w str, &'w str)> + 'a
    where
        'w: 'a,
    {
        self.headers.iter().map(move |hd| split_header(ws.get_str(hd.span)))
    }

    /// Drop every header flagged hop-by-hop, per RFC 7230 §6.1 connection-header handling.
    pub fn strip_hop_by_hop(&mut self) {
        self.headers.retain(|hd| !hd.flags.contains(HdrFlags::HOP_BY_HOP));
    }

    /// Encode into the packed object-headers wire format (§6):
    /// `nhd:u16be status:u16be` then NUL-terminated strings for proto/status/reason and each
    /// header, terminated by an empty string. Round-trips with [`HttpMsg::decode`] (property P7).
    #[must_use]
    pub fn encode(&self, ws: &Workspace) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.headers.len() as u16).to_be_bytes());
        let status = self.status(ws).unwrap_or(0);
        out.extend_from_slice(&status.to_be_bytes());
        for s in self.first_line {
            push_nul_terminated(&mut out, self.field(ws, s).unwrap_or(""));
        }
        for hd in &self.headers {
            push_nul_terminated(&mut out, ws.get_str(hd.span));
        }
        out.push(0);
        out
    }

    pub fn decode(kind: MsgKind, shd: u16, ws: &mut Workspace, buf: &[u8]) -> Result<Self, HttpError> {
        if buf.len() < 4 {
            return Err(HttpError::MalformedPacked);
        }
        let nhd = u16::from_be_bytes([buf[0], buf[1]]);
        let status = u16::from_be_bytes([buf[2], buf[3]]);
        let mut cursor = 4usize;
        let mut msg = HttpMsg::new(kind, shd.max(nhd));
        for slot in 0..3 {
            let (s, next) = read_nul_terminated(buf, cursor)?;
            cursor = next;
            msg.first_line[slot] = ws.copy_str(s)?;
        }
        if kind == MsgKind::Response {
            msg.first_line[1] = ws.copy_str(&status.to_string())?;
        }
        for _ in 0..nhd {
            let (s, next) = read_nul_terminated(buf, cursor)?;
            cursor = next;
            let (name, value) = split_header(s);
            msg.set_header(ws, name, value)?;
        }
        Ok(msg)
    }
}

impl fmt::Debug for HttpMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMsg")
            .field("kind", &self.kind)
            .field("nhd", &self.nhd())
            .finish()
    }
}

fn push_nul_terminated(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn read_nul_terminated(buf: &[u8], from: usize) -> Result<(&str, usize), HttpError> {
    let rel = buf[from..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(HttpError::MalformedPacked)?;
    let s = std::str::from_utf8(&buf[from..from + rel]).map_err(|_| HttpError::MalformedPacked)?;
    Ok((s, from + rel + 1))
}

/// Split a stored `"name: value"` field into its two parts, trimming a single leading space as
/// produced by [`HttpMsg::set_header`]'s `"{name}: {value}"` formatting.
fn split_header(stored: &str) -> (&str, &str) {
    match stored.split_once(':') {
        None => (stored, ""),
        Some((name, rest)) => (name, rest.strip_prefix(' ').unwrap_or(rest)),
    }
}

/// The `<length-byte><name>':'` header-id handle format (§6): `length-byte` is
/// `strlen(name)+1`, enabling a length-prefixed comparison before touching the bytes.
#[must_use]
pub fn header_id_string(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    out.push((name.len() + 1) as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(b':');
    out
}

#[must_use]
pub fn header_id_eq(handle: &[u8], name: &str) -> bool {
    handle.first().copied() == Some((name.len() + 1) as u8)
        && handle.len() == name.len() + 2
        && handle[1..1 + name.len()].eq_ignore_ascii_case(name.as_bytes())
}

const HOP_BY_HOP_NAMES: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_NAMES.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_headers() {
        let mut ws = Workspace::new(1024);
        let mut req = HttpMsg::new(MsgKind::Request, 16);
        req.set_request_line(&mut ws, "GET", "/x", "HTTP/1.1").unwrap();
        req.set_header(&mut ws, "Host", "a").unwrap();
        req.set_header(&mut ws, "Accept-Encoding", "gzip").unwrap();
        assert_eq!(req.method(&ws), Some("GET"));
        assert_eq!(req.header(&ws, "host"), Some("a"));
        assert_eq!(req.nhd(), 2);
    }

    #[test]
    fn capacity_enforced() {
        let mut ws = Workspace::new(1024);
        let mut req = HttpMsg::new(MsgKind::Request, 1);
        req.set_header(&mut ws, "A", "1").unwrap();
        assert!(matches!(
            req.set_header(&mut ws, "B", "2"),
            Err(HttpError::NoMoreSlots(1))
        ));
    }

    #[test]
    fn unset_compacts() {
        let mut ws = Workspace::new(1024);
        let mut req = HttpMsg::new(MsgKind::Request, 16);
        req.set_header(&mut ws, "A", "1").unwrap();
        req.set_header(&mut ws, "B", "2").unwrap();
        req.set_header(&mut ws, "A", "3").unwrap();
        req.unset_header(&ws, "a");
        assert_eq!(req.nhd(), 1);
        assert_eq!(req.header(&ws, "B"), Some("2"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut ws = Workspace::new(4096);
        let mut resp = HttpMsg::new(MsgKind::Response, 16);
        resp.set_status_line(&mut ws, "HTTP/1.1", 200, "OK").unwrap();
        resp.set_header(&mut ws, "Content-Type", "text/plain").unwrap();
        resp.set_header(&mut ws, "Cache-Control", "max-age=60").unwrap();
        let buf = resp.encode(&ws);

        let mut ws2 = Workspace::new(4096);
        let decoded = HttpMsg::decode(MsgKind::Response, 16, &mut ws2, &buf).unwrap();
        let buf2 = decoded.encode(&ws2);
        assert_eq!(buf, buf2);
        assert_eq!(decoded.status(&ws2), Some(200));
        assert_eq!(decoded.header(&ws2, "content-type"), Some("text/plain"));
    }

    #[test]
    fn header_id_handle() {
        let h = header_id_string("Host");
        assert!(header_id_eq(&h, "host"));
        assert!(!header_id_eq(&h, "hosts"));
    }
}
