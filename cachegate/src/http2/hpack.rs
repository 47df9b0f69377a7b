//! HPACK (RFC 7541): static/dynamic header tables, integer and string literal codecs, and the
//! canonical Huffman code table from Appendix B.
//!
//! No crate in the corpus carries an HPACK implementation (it's outside the domain any of the
//! pack's example repos touch), so this is hand-rolled against the RFC rather than adapted from a
//! teacher file - the one module in this crate without a direct corpus grounding source; see
//! `DESIGN.md`.
use std::collections::VecDeque;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum HpackError {
    #[error("truncated hpack integer")]
    TruncatedInteger,
    #[error("truncated hpack string literal")]
    TruncatedString,
    #[error("huffman code did not terminate on a valid symbol")]
    BadHuffmanCode,
    #[error("index {0} out of range of static+dynamic table")]
    BadIndex(u64),
    #[error("integer overflow decoding hpack varint")]
    IntegerOverflow,
    #[error("decoded string is not valid utf-8")]
    InvalidUtf8,
}

/// RFC 7541 §2.3.2: the 61-entry static table, 1-indexed as encoded on the wire.
pub const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Per-entry dynamic table accounting overhead (RFC 7541 §4.1): 32 bytes plus name+value length.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone)]
struct DynamicEntry {
    name: String,
    value: String,
}

impl DynamicEntry {
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// A decoder's header-table state: static table plus a per-connection dynamic table, persisted
/// across HEADERS frames on the same connection until `COMPRESSION_ERROR` or teardown.
pub struct Decoder {
    dynamic: VecDeque<DynamicEntry>,
    dynamic_size: usize,
    max_dynamic_size: usize,
}

impl Decoder {
    #[must_use]
    pub fn new(max_dynamic_size: usize) -> Self {
        Self { dynamic: VecDeque::new(), dynamic_size: 0, max_dynamic_size }
    }

    /// SETTINGS_HEADER_TABLE_SIZE from the peer shrinks (or grows) the decoder's own table.
    pub fn set_max_dynamic_size(&mut self, max: usize) {
        self.max_dynamic_size = max;
        self.evict_to_fit();
    }

    fn evict_to_fit(&mut self) {
        while self.dynamic_size > self.max_dynamic_size {
            let Some(evicted) = self.dynamic.pop_back() else { break };
            self.dynamic_size -= evicted.size();
        }
    }

    fn insert(&mut self, name: String, value: String) {
        let entry = DynamicEntry { name, value };
        self.dynamic_size += entry.size();
        self.dynamic.push_front(entry);
        self.evict_to_fit();
    }

    fn lookup(&self, index: u64) -> Result<(String, String), HpackError> {
        if index == 0 {
            return Err(HpackError::BadIndex(index));
        }
        let idx = index as usize;
        if idx <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[idx - 1];
            return Ok((n.to_string(), v.to_string()));
        }
        let dyn_idx = idx - STATIC_TABLE.len() - 1;
        self.dynamic
            .get(dyn_idx)
            .map(|e| (e.name.clone(), e.value.clone()))
            .ok_or(HpackError::BadIndex(index))
    }

    /// Decode one HEADERS/CONTINUATION payload's block into an ordered list of header fields.
    /// Indexing updates (literal-with-incremental-indexing, dynamic table size updates) mutate
    /// `self` even on a field that is later rejected by header validation - table state must stay
    /// consistent so the connection survives a stream-level rejection (§4.7).
    pub fn decode_block(&mut self, buf: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            let first = buf[pos];
            if first & 0x80 != 0 {
                // Indexed header field.
                let (index, next) = decode_integer(buf, pos, 7)?;
                pos = next;
                out.push(self.lookup(index)?);
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing.
                let (name, value, next) = self.decode_literal(buf, pos, 6)?;
                pos = next;
                self.insert(name.clone(), value.clone());
                out.push((name, value));
            } else if first & 0x20 != 0 {
                // Dynamic table size update.
                let (new_size, next) = decode_integer(buf, pos, 5)?;
                pos = next;
                self.set_max_dynamic_size(new_size as usize);
            } else {
                // Literal without indexing (0x00) or never-indexed (0x10): both decode the same
                // way for a receiver; the never-indexed bit is a re-encoding hint only.
                let (name, value, next) = self.decode_literal(buf, pos, 4)?;
                pos = next;
                out.push((name, value));
            }
        }
        Ok(out)
    }

    fn decode_literal(&self, buf: &[u8], pos: usize, prefix_bits: u8) -> Result<(String, String, usize), HpackError> {
        let (index, after_index) = decode_integer(buf, pos, prefix_bits)?;
        let (name, after_name) = if index == 0 {
            decode_string(buf, after_index)?
        } else {
            let (n, _) = self.lookup(index)?;
            (n, after_index)
        };
        let (value, after_value) = decode_string(buf, after_name)?;
        Ok((name, value, after_value))
    }
}

/// RFC 7541 §5.1: an N-bit-prefix variable-length integer.
fn decode_integer(buf: &[u8], pos: usize, prefix_bits: u8) -> Result<(u64, usize), HpackError> {
    let byte = *buf.get(pos).ok_or(HpackError::TruncatedInteger)?;
    let mask = (1u16 << prefix_bits) as u8 - 1;
    let mut value = u64::from(byte & mask);
    let mut cursor = pos + 1;
    if value < u64::from(mask) {
        return Ok((value, cursor));
    }
    let mut shift = 0u32;
    loop {
        let b = *buf.get(cursor).ok_or(HpackError::TruncatedInteger)?;
        cursor += 1;
        value = value
            .checked_add(u64::from(b & 0x7f).checked_shl(shift).ok_or(HpackError::IntegerOverflow)?)
            .ok_or(HpackError::IntegerOverflow)?;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(HpackError::IntegerOverflow);
        }
    }
    Ok((value, cursor))
}

fn encode_integer(out: &mut Vec<u8>, prefix_bits: u8, prefix_value: u8, mut value: u64) {
    let mask = (1u16 << prefix_bits) as u8 - 1;
    if value < u64::from(mask) {
        out.push(prefix_value | value as u8);
        return;
    }
    out.push(prefix_value | mask);
    value -= u64::from(mask);
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn decode_string(buf: &[u8], pos: usize) -> Result<(String, usize), HpackError> {
    let first = *buf.get(pos).ok_or(HpackError::TruncatedString)?;
    let huffman = first & 0x80 != 0;
    let (len, after_len) = decode_integer(buf, pos, 7)?;
    let len = len as usize;
    let end = after_len.checked_add(len).ok_or(HpackError::TruncatedString)?;
    let raw = buf.get(after_len..end).ok_or(HpackError::TruncatedString)?;
    let s = if huffman {
        huffman_decode(raw)?
    } else {
        String::from_utf8(raw.to_vec()).map_err(|_| HpackError::InvalidUtf8)?
    };
    Ok((s, end))
}

/// Encode a string literal; always emits it as a raw (non-Huffman) literal. This is a valid HPACK
/// encoding (Huffman is an optional compression, never required for correctness) and keeps the
/// encoder side of this module simple while the decoder still handles Huffman-encoded input from
/// clients (§4.7 lists HPACK decode failure as connection-fatal, so decode must stay general).
pub fn encode_string(out: &mut Vec<u8>, s: &str) {
    encode_integer(out, 7, 0x00, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Encode one literal header field without indexing (0x00 prefix) - used for response headers,
/// which cachegate never needs the peer to echo back via the dynamic table.
pub fn encode_literal_without_indexing(out: &mut Vec<u8>, name: &str, value: &str) {
    out.push(0x00);
    encode_string(out, name);
    encode_string(out, value);
}

include!("hpack_huffman_table.rs");

fn huffman_decode(data: &[u8]) -> Result<String, HpackError> {
    let mut out = Vec::new();
    let mut code = 0u32;
    let mut len = 0u8;
    for &byte in data {
        for bit_index in (0..8).rev() {
            let bit = (byte >> bit_index) & 1;
            code = (code << 1) | u32::from(bit);
            len += 1;
            if let Some(sym) = HUFFMAN_TABLE.iter().find(|(c, l, _)| *l == len && *c == code) {
                if sym.2 == 256 {
                    return Err(HpackError::BadHuffmanCode);
                }
                out.push(sym.2 as u8);
                code = 0;
                len = 0;
            }
            if len > 30 {
                return Err(HpackError::BadHuffmanCode);
            }
        }
    }
    // Remaining bits must be the EOS padding (all ones), up to 7 bits.
    if len > 0 {
        let padding = (1u32 << len) - 1;
        if code != padding {
            return Err(HpackError::BadHuffmanCode);
        }
    }
    String::from_utf8(out).map_err(|_| HpackError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_lookup_by_index() {
        let decoder = Decoder::new(4096);
        assert_eq!(decoder.lookup(2).unwrap(), (":method".to_string(), "GET".to_string()));
        assert_eq!(decoder.lookup(8).unwrap(), (":status".to_string(), "200".to_string()));
    }

    #[test]
    fn integer_roundtrip_small_and_large() {
        let mut buf = Vec::new();
        encode_integer(&mut buf, 5, 0, 10);
        assert_eq!(decode_integer(&buf, 0, 5).unwrap(), (10, 1));

        let mut buf2 = Vec::new();
        encode_integer(&mut buf2, 5, 0, 1337);
        assert_eq!(decode_integer(&buf2, 0, 5).unwrap().0, 1337);
    }

    #[test]
    fn indexed_field_decodes_from_static_table() {
        let mut decoder = Decoder::new(4096);
        let buf = [0x82]; // indexed field, index 2 = :method GET
        let headers = decoder.decode_block(&buf).unwrap();
        assert_eq!(headers, vec![(":method".to_string(), "GET".to_string())]);
    }

    #[test]
    fn literal_with_incremental_indexing_grows_dynamic_table() {
        let mut decoder = Decoder::new(4096);
        let mut buf = Vec::new();
        buf.push(0x40); // literal w/ incremental indexing, new name
        encode_string(&mut buf, "x-custom");
        encode_string(&mut buf, "value1");
        let headers = decoder.decode_block(&buf).unwrap();
        assert_eq!(headers, vec![("x-custom".to_string(), "value1".to_string())]);

        // Now reference it back via dynamic table index 62 (static table has 61 entries).
        let buf2 = [0xbe]; // indexed field, index 62
        let headers2 = decoder.decode_block(&buf2).unwrap();
        assert_eq!(headers2, vec![("x-custom".to_string(), "value1".to_string())]);
    }

    #[test]
    fn literal_without_indexing_round_trips_through_encoder() {
        let mut out = Vec::new();
        encode_literal_without_indexing(&mut out, "x-foo", "bar");
        let mut decoder = Decoder::new(4096);
        let headers = decoder.decode_block(&out).unwrap();
        assert_eq!(headers, vec![("x-foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn dynamic_table_size_update_evicts() {
        let mut decoder = Decoder::new(4096);
        let mut insert = Vec::new();
        insert.push(0x40);
        encode_string(&mut insert, "name");
        encode_string(&mut insert, "value-that-is-reasonably-long");
        decoder.decode_block(&insert).unwrap();
        assert!(decoder.dynamic_size > 0);

        let mut resize = Vec::new();
        encode_integer(&mut resize, 5, 0x20, 0);
        decoder.decode_block(&resize).unwrap();
        assert_eq!(decoder.dynamic_size, 0);
    }

    #[test]
    fn huffman_decodes_rfc_example_www_example_com() {
        // RFC 7541 C.4.1: huffman-encoded "www.example.com"
        let encoded: [u8; 12] =
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff];
        assert_eq!(huffman_decode(&encoded).unwrap(), "www.example.com");
    }
}
