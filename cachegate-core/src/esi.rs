//! ESI program encoding (§4.4.1/§6): the binary opcode stream the fetch-side parser produces
//! and the deliver-side interpreter consumes.
//!
//! Opcode byte meanings:
//! ```text
//! V1/V2/V8  verbatim run, length in 1/2/8 BE bytes
//! C1/C2/C8  CRC32 of the preceding verbatim run (gzip objects only), length in 1/2/8 BE bytes
//! S1/S2/S8  skip run, length in 1/2/8 BE bytes
//! IC        ESI include: NUL-terminated src, NUL-terminated host-override
//! IA        ESI include, onerror=continue inverted (abort-propagating)
//! GZ        leading marker: object is gzip, tail CRC+length required
//! ```

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum EsiError {
    #[error("truncated esi program")]
    Truncated,
    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),
    #[error("include src/host not NUL-terminated")]
    UnterminatedInclude,
    #[error("include src or host is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EsiOp {
    /// Forward `len` bytes pulled verbatim from backing storage.
    Verbatim { len: u64 },
    /// CRC32 of the immediately preceding verbatim run (gzip objects only).
    Crc32 { value: u32 },
    /// Drop `len` bytes.
    Skip { len: u64 },
    /// `esi:include`, normal onerror semantics (failure does not abort the parent).
    Include { src: String, host: Option<String> },
    /// `esi:include`, abort-propagating (onerror=continue inverted).
    IncludeAbort { src: String, host: Option<String> },
    /// Leading marker: this object's program is gzip-bearing.
    GzipMarker,
}

const OP_V1: u8 = b'V' ^ 0x01;
const OP_V2: u8 = b'V' ^ 0x02;
const OP_V8: u8 = b'V' ^ 0x08;
const OP_C1: u8 = b'C' ^ 0x01;
const OP_C2: u8 = b'C' ^ 0x02;
const OP_C8: u8 = b'C' ^ 0x08;
const OP_S1: u8 = b'S' ^ 0x01;
const OP_S2: u8 = b'S' ^ 0x02;
const OP_S8: u8 = b'S' ^ 0x08;
const OP_IC: u8 = 0xE1;
const OP_IA: u8 = 0xE2;
const OP_GZ: u8 = 0xE3;

fn width_tag(base: u8, width: u8) -> u8 {
    base ^ width
}

fn encode_len(out: &mut Vec<u8>, tag_base: u8, len: u64) {
    if len <= u64::from(u8::MAX) {
        out.push(width_tag(tag_base, 1));
        out.push(len as u8);
    } else if len <= u64::from(u16::MAX) {
        out.push(width_tag(tag_base, 2));
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(width_tag(tag_base, 8));
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Append a single opcode to an in-progress program buffer.
pub fn encode_op(out: &mut Vec<u8>, op: &EsiOp) {
    match op {
        EsiOp::Verbatim { len } => encode_len(out, b'V', *len),
        EsiOp::Skip { len } => encode_len(out, b'S', *len),
        EsiOp::Crc32 { value } => {
            out.push(OP_C1);
            out.push(4);
            out.extend_from_slice(&value.to_be_bytes());
        }
        EsiOp::Include { src, host } => encode_include(out, OP_IC, src, host.as_deref()),
        EsiOp::IncludeAbort { src, host } => encode_include(out, OP_IA, src, host.as_deref()),
        EsiOp::GzipMarker => out.push(OP_GZ),
    }
}

fn encode_include(out: &mut Vec<u8>, tag: u8, src: &str, host: Option<&str>) {
    out.push(tag);
    out.extend_from_slice(src.as_bytes());
    out.push(0);
    if let Some(h) = host {
        out.extend_from_slice(h.as_bytes());
    }
    out.push(0);
}

#[must_use]
pub fn encode(ops: &[EsiOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        encode_op(&mut out, op);
    }
    out
}

/// Incrementally decode one opcode from the head of `buf`, returning it and the remainder.
pub fn decode_one(buf: &[u8]) -> Result<(EsiOp, &[u8]), EsiError> {
    let (&tag, rest) = buf.split_first().ok_or(EsiError::Truncated)?;
    if tag == OP_GZ {
        return Ok((EsiOp::GzipMarker, rest));
    }
    if tag == OP_IC || tag == OP_IA {
        let (src, rest) = read_nul_str(rest)?;
        let (host_raw, rest) = read_nul_str(rest)?;
        let host = if host_raw.is_empty() { None } else { Some(host_raw) };
        let op = if tag == OP_IC {
            EsiOp::Include { src, host }
        } else {
            EsiOp::IncludeAbort { src, host }
        };
        return Ok((op, rest));
    }
    if tag == OP_C1 || tag == OP_C2 || tag == OP_C8 {
        let (&width, rest) = rest.split_first().ok_or(EsiError::Truncated)?;
        if width != 4 || rest.len() < 4 {
            return Err(EsiError::Truncated);
        }
        let value = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        return Ok((EsiOp::Crc32 { value }, &rest[4..]));
    }
    let (base, ctor): (u8, fn(u64) -> EsiOp) = if matches!(tag, OP_V1 | OP_V2 | OP_V8) {
        (b'V', |len| EsiOp::Verbatim { len })
    } else if matches!(tag, OP_S1 | OP_S2 | OP_S8) {
        (b'S', |len| EsiOp::Skip { len })
    } else {
        return Err(EsiError::UnknownOpcode(tag));
    };
    let width = tag ^ base;
    let (len, rest) = read_len(rest, width)?;
    Ok((ctor(len), rest))
}

fn read_len(buf: &[u8], width: u8) -> Result<(u64, &[u8]), EsiError> {
    let n = width as usize;
    if buf.len() < n {
        return Err(EsiError::Truncated);
    }
    let (bytes, rest) = buf.split_at(n);
    let mut padded = [0u8; 8];
    padded[8 - n..].copy_from_slice(bytes);
    Ok((u64::from_be_bytes(padded), rest))
}

fn read_nul_str(buf: &[u8]) -> Result<(String, &[u8]), EsiError> {
    let pos = buf.iter().position(|&b| b == 0).ok_or(EsiError::UnterminatedInclude)?;
    let s = std::str::from_utf8(&buf[..pos]).map_err(|_| EsiError::InvalidUtf8)?;
    Ok((s.to_string(), &buf[pos + 1..]))
}

/// Decode a full program into its opcode sequence.
pub fn decode(mut buf: &[u8]) -> Result<Vec<EsiOp>, EsiError> {
    let mut ops = Vec::new();
    while !buf.is_empty() {
        let (op, rest) = decode_one(buf)?;
        ops.push(op);
        buf = rest;
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_width_selection() {
        let ops = vec![
            EsiOp::Verbatim { len: 10 },
            EsiOp::Verbatim { len: 1000 },
            EsiOp::Verbatim { len: 100_000 },
        ];
        let buf = encode(&ops);
        assert_eq!(buf[0], OP_V1);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn skip_and_crc_roundtrip() {
        let ops = vec![
            EsiOp::Verbatim { len: 42 },
            EsiOp::Crc32 { value: 0xDEAD_BEEF },
            EsiOp::Skip { len: 7 },
        ];
        let buf = encode(&ops);
        assert_eq!(decode(&buf).unwrap(), ops);
    }

    #[test]
    fn include_roundtrip_with_and_without_host() {
        let ops = vec![
            EsiOp::Include { src: "/frag.html".into(), host: None },
            EsiOp::IncludeAbort { src: "/frag2.html".into(), host: Some("other.example".into()) },
        ];
        let buf = encode(&ops);
        assert_eq!(decode(&buf).unwrap(), ops);
    }

    #[test]
    fn gzip_marker_roundtrip() {
        let ops = vec![EsiOp::GzipMarker, EsiOp::Verbatim { len: 3 }];
        let buf = encode(&ops);
        assert_eq!(decode(&buf).unwrap(), ops);
    }

    #[test]
    fn truncated_program_errors() {
        let buf = [OP_V2, 0x00];
        assert_eq!(decode(&buf).unwrap_err(), EsiError::Truncated);
    }
}
