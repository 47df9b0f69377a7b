//! PROXY protocol v1 (text) and v2 (binary) codec (§4.6).
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V1_MAX_LEN: usize = 107;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ProxyError {
    #[error("unrecognised proxy protocol signature")]
    BadSignature,
    #[error("proxy v1 line malformed: {0}")]
    BadV1(String),
    #[error("proxy v1 line exceeds {V1_MAX_LEN} bytes")]
    V1TooLong,
    #[error("proxy v2 header malformed: {0}")]
    BadV2(String),
    #[error("proxy v2 crc32c mismatch")]
    CrcMismatch,
    #[error("need {0} more bytes to complete the preamble")]
    Incomplete(usize),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProxyVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProxyTlv {
    pub kind: u8,
    pub value: Vec<u8>,
}

pub const TLV_ALPN: u8 = 0x01;
pub const TLV_AUTHORITY: u8 = 0x02;
pub const TLV_CRC32C: u8 = 0x03;
pub const TLV_NOOP: u8 = 0x04;
pub const TLV_SSL: u8 = 0x20;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProxyHeader {
    /// v2 LOCAL command: connection not proxied, addresses are meaningless.
    Local,
    Proxied {
        version: ProxyVersion,
        src: SocketAddr,
        dst: SocketAddr,
        tlvs: Vec<ProxyTlv>,
    },
}

/// How many bytes of `buf` (the bytes read so far from the socket) are needed before the
/// preamble can be fully parsed, or `None` once that's known to be complete.
pub fn completion_needed(buf: &[u8]) -> Result<Option<usize>, ProxyError> {
    if buf.len() >= 5 && buf[..5] == b"PROXY"[..] {
        return Ok(match buf.iter().position(|&b| b == b'\n') {
            Some(_) => None,
            None if buf.len() >= V1_MAX_LEN => return Err(ProxyError::V1TooLong),
            None => Some(1),
        });
    }
    if buf.len() >= 12 && buf[..12] == V2_SIGNATURE {
        if buf.len() < 16 {
            return Ok(Some(16 - buf.len()));
        }
        let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let total = 16 + len;
        return Ok(if buf.len() >= total {
            None
        } else {
            Some(total - buf.len())
        });
    }
    if buf.len() < 12 {
        return Ok(Some(12 - buf.len()));
    }
    Err(ProxyError::BadSignature)
}

pub fn parse(buf: &[u8]) -> Result<ProxyHeader, ProxyError> {
    if buf.starts_with(b"PROXY") {
        parse_v1(buf)
    } else if buf.starts_with(&V2_SIGNATURE) {
        parse_v2(buf)
    } else {
        Err(ProxyError::BadSignature)
    }
}

fn parse_v1(buf: &[u8]) -> Result<ProxyHeader, ProxyError> {
    if buf.len() > V1_MAX_LEN {
        return Err(ProxyError::V1TooLong);
    }
    let line_end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ProxyError::Incomplete(1))?;
    if line_end == 0 || buf[line_end - 1] != b'\r' {
        return Err(ProxyError::BadV1("missing CRLF".into()));
    }
    let line = std::str::from_utf8(&buf[..line_end - 1]).map_err(|_| ProxyError::BadV1("non-utf8".into()))?;
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(ProxyError::BadV1("missing PROXY token".into()));
    }
    let af = parts.next().ok_or_else(|| ProxyError::BadV1("missing AF".into()))?;
    let src_ip = parts.next().ok_or_else(|| ProxyError::BadV1("missing src ip".into()))?;
    let dst_ip = parts.next().ok_or_else(|| ProxyError::BadV1("missing dst ip".into()))?;
    let src_port = parts.next().ok_or_else(|| ProxyError::BadV1("missing src port".into()))?;
    let dst_port = parts.next().ok_or_else(|| ProxyError::BadV1("missing dst port".into()))?;
    if parts.next().is_some() {
        return Err(ProxyError::BadV1("trailing garbage".into()));
    }
    let (src_ip, dst_ip): (IpAddr, IpAddr) = match af {
        "TCP4" => (
            src_ip.parse::<Ipv4Addr>().map_err(|e| ProxyError::BadV1(e.to_string()))?.into(),
            dst_ip.parse::<Ipv4Addr>().map_err(|e| ProxyError::BadV1(e.to_string()))?.into(),
        ),
        "TCP6" => (
            src_ip.parse::<Ipv6Addr>().map_err(|e| ProxyError::BadV1(e.to_string()))?.into(),
            dst_ip.parse::<Ipv6Addr>().map_err(|e| ProxyError::BadV1(e.to_string()))?.into(),
        ),
        other => return Err(ProxyError::BadV1(format!("unsupported AF {other}"))),
    };
    let src_port: u16 = src_port.parse().map_err(|_| ProxyError::BadV1("bad src port".into()))?;
    let dst_port: u16 = dst_port.parse().map_err(|_| ProxyError::BadV1("bad dst port".into()))?;
    Ok(ProxyHeader::Proxied {
        version: ProxyVersion::V1,
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        tlvs: Vec::new(),
    })
}

fn parse_v2(buf: &[u8]) -> Result<ProxyHeader, ProxyError> {
    if buf.len() < 16 {
        return Err(ProxyError::Incomplete(16 - buf.len()));
    }
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(ProxyError::BadV2("bad version nibble".into()));
    }
    let cmd = ver_cmd & 0x0F;
    let fam_proto = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if buf.len() < 16 + len {
        return Err(ProxyError::Incomplete(16 + len - buf.len()));
    }
    if len > 1024 {
        return Err(ProxyError::BadV2("payload exceeds 1024 bytes".into()));
    }
    let payload = &buf[16..16 + len];

    if cmd == 0 {
        return Ok(ProxyHeader::Local);
    }

    let (src, dst, addr_len) = match fam_proto {
        0x11 => {
            // IPv4 / TCP
            if payload.len() < 12 {
                return Err(ProxyError::BadV2("truncated ipv4 address block".into()));
            }
            let src_ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let dst_ip = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            let src_port = u16::from_be_bytes([payload[8], payload[9]]);
            let dst_port = u16::from_be_bytes([payload[10], payload[11]]);
            (
                SocketAddr::new(src_ip.into(), src_port),
                SocketAddr::new(dst_ip.into(), dst_port),
                12,
            )
        }
        0x21 => {
            // IPv6 / TCP
            if payload.len() < 36 {
                return Err(ProxyError::BadV2("truncated ipv6 address block".into()));
            }
            let mut s = [0u8; 16];
            let mut d = [0u8; 16];
            s.copy_from_slice(&payload[0..16]);
            d.copy_from_slice(&payload[16..32]);
            let src_port = u16::from_be_bytes([payload[32], payload[33]]);
            let dst_port = u16::from_be_bytes([payload[34], payload[35]]);
            (
                SocketAddr::new(Ipv6Addr::from(s).into(), src_port),
                SocketAddr::new(Ipv6Addr::from(d).into(), dst_port),
                36,
            )
        }
        0x00 => {
            // UNSPEC: family/proto ignored, no address block to consume.
            return Ok(ProxyHeader::Local);
        }
        other => return Err(ProxyError::BadV2(format!("unsupported family/proto byte {other:#x}"))),
    };

    let tlvs = parse_tlvs(&payload[addr_len..])?;
    verify_crc32c(buf, 16 + len, &tlvs)?;

    Ok(ProxyHeader::Proxied {
        version: ProxyVersion::V2,
        src,
        dst,
        tlvs,
    })
}

fn parse_tlvs(mut buf: &[u8]) -> Result<Vec<ProxyTlv>, ProxyError> {
    let mut tlvs = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            return Err(ProxyError::BadV2("truncated TLV header".into()));
        }
        let kind = buf[0];
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + len {
            return Err(ProxyError::BadV2("truncated TLV value".into()));
        }
        tlvs.push(ProxyTlv {
            kind,
            value: buf[3..3 + len].to_vec(),
        });
        buf = &buf[3 + len..];
    }
    Ok(tlvs)
}

/// If a CRC32C TLV is present, verify it over the whole frame with that TLV's value field
/// zeroed (§4.6, property P8: verifies fully, or is rejected — never partially honoured).
fn verify_crc32c(full_frame: &[u8], frame_len: usize, tlvs: &[ProxyTlv]) -> Result<(), ProxyError> {
    let Some(crc_tlv) = tlvs.iter().find(|t| t.kind == TLV_CRC32C) else {
        return Ok(());
    };
    if crc_tlv.value.len() != 4 {
        return Err(ProxyError::BadV2("CRC32C TLV must be 4 bytes".into()));
    }
    let claimed = u32::from_be_bytes([
        crc_tlv.value[0],
        crc_tlv.value[1],
        crc_tlv.value[2],
        crc_tlv.value[3],
    ]);

    // Zero the CRC32C TLV's value bytes within a scratch copy of the frame before recomputing.
    let mut scratch = full_frame[..frame_len].to_vec();
    let crc_value_offset = find_tlv_value_offset(&scratch[16..frame_len], TLV_CRC32C)
        .ok_or_else(|| ProxyError::BadV2("CRC32C TLV not found on rescan".into()))?
        + 16;
    scratch[crc_value_offset..crc_value_offset + 4].fill(0);

    let computed = crc32fast::hash(&scratch);
    if computed == claimed {
        Ok(())
    } else {
        Err(ProxyError::CrcMismatch)
    }
}

fn find_tlv_value_offset(mut buf: &[u8], target_kind: u8) -> Option<usize> {
    let base = 0usize;
    let mut offset = base;
    // We don't know where the address block ends relative to `buf` here, so this helper is only
    // ever called with the *payload-relative* bytes already sliced by the caller; re-scan from
    // the first plausible TLV boundary by trying every offset is wasteful, so instead callers
    // pass the TLV-only region. To keep this self-contained we scan for the literal pattern.
    while buf.len() >= 3 {
        let kind = buf[0];
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + len {
            return None;
        }
        if kind == target_kind {
            return Some(offset + 3);
        }
        buf = &buf[3 + len..];
        offset += 3 + len;
    }
    None
}

#[must_use]
pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let af = if src.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {af} {} {} {} {}\r\n",
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
    .into_bytes()
}

#[must_use]
pub fn encode_v2(src: SocketAddr, dst: SocketAddr, tlvs: &[ProxyTlv]) -> Vec<u8> {
    let mut payload = Vec::new();
    let fam_proto: u8 = match (src, dst) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => 0x11,
        _ => 0x21,
    };
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => {
            payload.extend_from_slice(&s.ip().octets());
            payload.extend_from_slice(&d.ip().octets());
            payload.extend_from_slice(&s.port().to_be_bytes());
            payload.extend_from_slice(&d.port().to_be_bytes());
        }
        _ => {
            let s_ip = match src.ip() {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            };
            let d_ip = match dst.ip() {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            };
            payload.extend_from_slice(&s_ip.octets());
            payload.extend_from_slice(&d_ip.octets());
            payload.extend_from_slice(&src.port().to_be_bytes());
            payload.extend_from_slice(&dst.port().to_be_bytes());
        }
    }
    for tlv in tlvs {
        payload.push(tlv.kind);
        payload.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        payload.extend_from_slice(&tlv.value);
    }

    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&V2_SIGNATURE);
    out.push(0x21); // version 2, command PROXY
    out.push(fam_proto);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_roundtrip() {
        let src: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        let dst: SocketAddr = "192.0.2.2:80".parse().unwrap();
        let buf = encode_v1(src, dst);
        assert!(completion_needed(&buf).unwrap().is_none());
        let parsed = parse(&buf).unwrap();
        assert_eq!(
            parsed,
            ProxyHeader::Proxied { version: ProxyVersion::V1, src, dst, tlvs: vec![] }
        );
    }

    #[test]
    fn v1_rejects_bad_af() {
        let buf = b"PROXY UNIX /a /b 0 0\r\n";
        assert!(parse(buf).is_err());
    }

    #[test]
    fn v2_roundtrip_without_crc() {
        let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let buf = encode_v2(src, dst, &[]);
        assert!(completion_needed(&buf).unwrap().is_none());
        let parsed = parse(&buf).unwrap();
        assert_eq!(
            parsed,
            ProxyHeader::Proxied { version: ProxyVersion::V2, src, dst, tlvs: vec![] }
        );
    }

    #[test]
    fn v2_crc32c_verifies_when_correct() {
        let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let mut buf = encode_v2(src, dst, &[ProxyTlv { kind: TLV_CRC32C, value: vec![0; 4] }]);
        let crc_val_offset = buf.len() - 4;
        let computed = {
            let mut scratch = buf.clone();
            scratch[crc_val_offset..].fill(0);
            crc32fast::hash(&scratch)
        };
        buf[crc_val_offset..].copy_from_slice(&computed.to_be_bytes());
        let parsed = parse(&buf).unwrap();
        assert!(matches!(parsed, ProxyHeader::Proxied { .. }));
    }

    #[test]
    fn v2_crc32c_mismatch_is_rejected() {
        let src: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let mut buf = encode_v2(src, dst, &[ProxyTlv { kind: TLV_CRC32C, value: vec![0; 4] }]);
        let crc_val_offset = buf.len() - 4;
        buf[crc_val_offset..].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(parse(&buf).unwrap_err(), ProxyError::CrcMismatch);
    }

    #[test]
    fn v2_local_command_ignored() {
        let mut buf = V2_SIGNATURE.to_vec();
        buf.push(0x20); // version 2, command LOCAL
        buf.push(0x00);
        buf.extend_from_slice(&0u16.to_be_bytes());
        assert_eq!(parse(&buf).unwrap(), ProxyHeader::Local);
    }
}
