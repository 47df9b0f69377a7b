//! HTTP/2 frame header codec (§4.7, RFC 7540 §4.1): the 9-byte length/type/flags/stream-id
//! prefix every frame carries.

pub const FRAME_HEADER_LEN: usize = 9;
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameType {
    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct FrameFlags: u8 {
        const END_STREAM  = 0x01;
        const ACK         = 0x01;
        const END_HEADERS = 0x04;
        const PADDED      = 0x08;
        const PRIORITY    = 0x20;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    /// 31-bit stream id; the reserved high bit MUST be ignored on receive (§6 EXTERNAL
    /// INTERFACES) and is always zero on send.
    pub stream_id: u32,
}

/// Parse the fixed 9-byte frame header. Caller is responsible for then reading exactly `length`
/// more bytes as the payload.
#[must_use]
pub fn parse_header(buf: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
    let length = u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]);
    let frame_type = FrameType::from_byte(buf[3]);
    let flags = FrameFlags::from_bits_truncate(buf[4]);
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    FrameHeader { length, frame_type, flags, stream_id }
}

#[must_use]
pub fn encode_header(frame_type: u8, flags: FrameFlags, stream_id: u32, length: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut out = [0u8; FRAME_HEADER_LEN];
    out[0] = (length >> 16) as u8;
    out[1] = (length >> 8) as u8;
    out[2] = length as u8;
    out[3] = frame_type;
    out[4] = flags.bits();
    out[5..9].copy_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out
}

/// Parse a SETTINGS frame payload into ordered (id, value) pairs (RFC 7540 §6.5.1: six bytes per
/// entry, id then BE32 value).
#[must_use]
pub fn parse_settings(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|c| (u16::from_be_bytes([c[0], c[1]]), u32::from_be_bytes([c[2], c[3], c[4], c[5]])))
        .collect()
}

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;

/// Encode a complete `RST_STREAM` frame (header + 4-byte error code), §6.4: the wire form of a
/// stream-fatal error that lets the connection itself survive.
#[must_use]
pub fn encode_rst_stream(stream_id: u32, error_code: u32) -> Vec<u8> {
    let mut out = encode_header(0x3, FrameFlags::empty(), stream_id, 4).to_vec();
    out.extend_from_slice(&error_code.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_strips_reserved_bit() {
        let encoded = encode_header(0x1, FrameFlags::END_HEADERS | FrameFlags::END_STREAM, 3, 42);
        let decoded = parse_header(&encoded);
        assert_eq!(decoded.length, 42);
        assert_eq!(decoded.frame_type, FrameType::Headers);
        assert_eq!(decoded.stream_id, 3);
        assert!(decoded.flags.contains(FrameFlags::END_HEADERS));
    }

    #[test]
    fn reserved_bit_on_stream_id_is_ignored_on_receive() {
        let mut raw = encode_header(0x4, FrameFlags::empty(), 0, 0);
        raw[5] |= 0x80; // set the reserved bit
        let decoded = parse_header(&raw);
        assert_eq!(decoded.stream_id, 0);
    }

    #[test]
    fn settings_payload_parses_pairs() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        payload.extend_from_slice(&65535u32.to_be_bytes());
        let parsed = parse_settings(&payload);
        assert_eq!(parsed, vec![(SETTINGS_INITIAL_WINDOW_SIZE, 65535)]);
    }
}
