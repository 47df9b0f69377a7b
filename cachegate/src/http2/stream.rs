//! Per-stream state (§4.7 "H/2 stream"): implicit state tracked by frame rules, flow-control
//! windows, and the pseudoheader validation rules from the "Header validation" subsection.

use std::collections::VecDeque;

use bytes::Bytes;

use super::H2Error;

pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    Closed,
}

#[derive(Debug, Default, Clone)]
pub struct Pseudoheaders {
    pub method: Option<String>,
    pub path: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
}

/// Validate one decoded header field against §4.7's rules, folding pseudoheaders into
/// `Pseudoheaders` and regular fields into `fields`. Returns a stream error (not connection-fatal)
/// on a violation so the caller can RST_STREAM while leaving the connection, and the HPACK table
/// state mutated by the decode, intact.
pub fn validate_field(
    name: &str,
    value: &str,
    pseudo: &mut Pseudoheaders,
    fields: &mut Vec<(String, String)>,
    seen_regular_field: &mut bool,
) -> Result<(), H2Error> {
    if let Some(pseudo_name) = name.strip_prefix(':') {
        if *seen_regular_field {
            return Err(H2Error::ProtocolError("pseudoheader after regular field".into()));
        }
        match pseudo_name {
            "method" => pseudo.method = Some(value.to_string()),
            "path" => {
                if value.is_empty() {
                    return Err(H2Error::ProtocolError(":path must not be empty".into()));
                }
                if pseudo.path.is_some() {
                    return Err(H2Error::ProtocolError("duplicate :path".into()));
                }
                pseudo.path = Some(value.to_string());
            }
            "scheme" => {
                if pseudo.scheme.is_some() {
                    return Err(H2Error::ProtocolError("duplicate :scheme".into()));
                }
                pseudo.scheme = Some(value.to_string());
            }
            "authority" => {
                if pseudo.authority.is_some() {
                    return Err(H2Error::ProtocolError("duplicate :authority".into()));
                }
                pseudo.authority = Some(value.to_string());
            }
            _ => return Err(H2Error::ProtocolError(format!("unknown pseudoheader :{pseudo_name}"))),
        }
        return Ok(());
    }

    *seen_regular_field = true;
    if name.is_empty() || name.contains(':') || name.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(H2Error::ProtocolError(format!("invalid field name {name:?}")));
    }
    if !is_valid_header_value(value) {
        return Err(H2Error::ProtocolError(format!("invalid field value for {name:?}")));
    }
    fields.push((name.to_string(), value.to_string()));
    Ok(())
}

/// `vct_ishdrval`: ASCII VCHAR + HTAB + obs-text, and no leading/trailing whitespace.
fn is_valid_header_value(value: &str) -> bool {
    if value.starts_with([' ', '\t']) || value.ends_with([' ', '\t']) {
        return false;
    }
    value.bytes().all(|b| b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80)
}

/// Finalize a header block into a projected request: `:authority` is rewritten to `Host:` per
/// §4.7. Missing `:scheme` is a stream error.
pub fn finish_headers(pseudo: Pseudoheaders, mut fields: Vec<(String, String)>) -> Result<(String, String, String, Vec<(String, String)>), H2Error> {
    let scheme = pseudo.scheme.ok_or_else(|| H2Error::MissingScheme)?;
    let method = pseudo.method.unwrap_or_default();
    let path = pseudo.path.unwrap_or_else(|| "/".to_string());
    if let Some(authority) = pseudo.authority {
        fields.insert(0, ("host".to_string(), authority));
    }
    Ok((method, path, scheme, fields))
}

pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub self_window: i64,
    pub peer_window: i64,
    pub body: Vec<u8>,
    pub pseudo: Pseudoheaders,
    pub fields: Vec<(String, String)>,
    pub seen_regular_field: bool,
    pub dependency: Option<u32>,
    pub weight: u8,
    pub exclusive: bool,
    pub queue: VecDeque<Bytes>,
    pub rst_error_code: Option<u32>,
}

impl Stream {
    #[must_use]
    pub fn new(id: u32, initial_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            self_window: initial_window,
            peer_window: initial_window,
            body: Vec::new(),
            pseudo: Pseudoheaders::default(),
            fields: Vec::new(),
            seen_regular_field: false,
            dependency: None,
            weight: 16,
            exclusive: false,
            queue: VecDeque::new(),
            rst_error_code: None,
        }
    }

    /// Applies a DATA frame's payload length against both `self_window` and the connection's
    /// window (the latter handled by the caller): subtract own window, append to body (§4.7 DATA
    /// row).
    pub fn on_data(&mut self, payload: &[u8], end_stream: bool) {
        self.self_window -= payload.len() as i64;
        self.body.extend_from_slice(payload);
        if end_stream {
            self.state = StreamState::HalfClosedRemote;
        }
    }

    /// Sending a DATA frame decrements the stream's peer-view window by the frame length (P5).
    pub fn on_data_sent(&mut self, len: usize) {
        self.peer_window -= len as i64;
    }

    pub fn apply_window_update(&mut self, increment: u32) {
        self.peer_window += i64::from(increment);
    }

    pub fn apply_initial_window_delta(&mut self, delta: i64) {
        self.peer_window += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_uppercase_field_name() {
        let mut pseudo = Pseudoheaders::default();
        let mut fields = Vec::new();
        let mut seen = false;
        let result = validate_field("Upper-Case", "x", &mut pseudo, &mut fields, &mut seen);
        assert!(matches!(result, Err(H2Error::ProtocolError(_))));
    }

    #[test]
    fn rejects_duplicate_scheme() {
        let mut pseudo = Pseudoheaders { scheme: Some("https".into()), ..Default::default() };
        let mut fields = Vec::new();
        let mut seen = false;
        let result = validate_field(":scheme", "http", &mut pseudo, &mut fields, &mut seen);
        assert!(matches!(result, Err(H2Error::ProtocolError(_))));
    }

    #[test]
    fn rejects_empty_path() {
        let mut pseudo = Pseudoheaders::default();
        let mut fields = Vec::new();
        let mut seen = false;
        let result = validate_field(":path", "", &mut pseudo, &mut fields, &mut seen);
        assert!(result.is_err());
    }

    #[test]
    fn authority_is_projected_to_host() {
        let pseudo = Pseudoheaders {
            method: Some("GET".into()),
            path: Some("/".into()),
            scheme: Some("https".into()),
            authority: Some("example.com".into()),
        };
        let (_, _, _, fields) = finish_headers(pseudo, Vec::new()).unwrap();
        assert_eq!(fields[0], ("host".to_string(), "example.com".to_string()));
    }

    #[test]
    fn missing_scheme_is_rejected_at_finish() {
        let pseudo = Pseudoheaders { method: Some("GET".into()), path: Some("/".into()), ..Default::default() };
        assert!(matches!(finish_headers(pseudo, Vec::new()), Err(H2Error::MissingScheme)));
    }

    #[test]
    fn data_frame_updates_window_and_body() {
        let mut s = Stream::new(1, DEFAULT_WINDOW_SIZE);
        s.on_data(b"hello", false);
        assert_eq!(s.self_window, DEFAULT_WINDOW_SIZE - 5);
        assert_eq!(s.body, b"hello");
        assert_eq!(s.state, StreamState::Idle);
        s.on_data(b"!", true);
        assert_eq!(s.state, StreamState::HalfClosedRemote);
    }
}
