//! `esi` VFP/VDP stage (§4.3/§4.4): fetch-side this buffers the full body and replaces it with the
//! compiled opcode program from `crate::esi::parser`; deliver-side interpretation needs to await
//! sub-requests for `esi:include`, which the synchronous `Filter` trait can't express, so it runs
//! outside the `Chain` - the caller runs `crate::esi::deliver::deliver` directly once this stage's
//! program and the object's backing bytes are both in hand. This mirrors the teacher's own split
//! between VFP (thread-synchronous) and the ESI sub-request machinery (which re-embarks the
//! calling thread rather than running inline in the filter).
use super::{Action, Filter, FilterError};

/// Fetch-side stage: buffers the whole body (ESI compilation needs it all) and, on `End`,
/// compiles it into the binary opcode program consumed later by `crate::esi::deliver`.
pub struct EsiParseFilter {
    buf: Vec<u8>,
    is_gzip: bool,
    ended: bool,
}

impl EsiParseFilter {
    #[must_use]
    pub fn new(is_gzip: bool) -> Self {
        Self { buf: Vec::new(), is_gzip, ended: false }
    }
}

impl Filter for EsiParseFilter {
    fn name(&self) -> &'static str {
        "esi"
    }

    fn bytes(&mut self, action: Action, data: &[u8], out: &mut Vec<u8>) -> Result<Action, FilterError> {
        if self.ended {
            return Err(FilterError::DoubleEnd(self.name()));
        }
        self.buf.extend_from_slice(data);
        if action == Action::End {
            self.ended = true;
            let ops = crate::esi::parser::parse(&self.buf, self.is_gzip);
            out.extend_from_slice(&cachegate_core::esi::encode(&ops));
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_program_only_at_end() {
        let mut filter = EsiParseFilter::new(false);
        let mut out = Vec::new();
        filter.bytes(Action::Null, b"AAA<esi:include src=\"/c\"/>", &mut out).unwrap();
        assert!(out.is_empty());
        filter.bytes(Action::End, b"BBB", &mut out).unwrap();
        let ops = cachegate_core::esi::decode(&out).unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn double_end_is_rejected() {
        let mut filter = EsiParseFilter::new(false);
        let mut out = Vec::new();
        filter.bytes(Action::End, b"x", &mut out).unwrap();
        assert!(filter.bytes(Action::End, b"y", &mut out).is_err());
    }
}
