//! `testgunzip` VFP stage: verify a backend response labelled `Content-Encoding: gzip` is
//! actually decodable, without altering the bytes passed downstream (§4.3 fetch-side default
//! list: used when the object claims gzip but `do_gunzip` is off).
use flate2::write::GzDecoder;
use std::io::Write;

use super::{Action, Filter, FilterError};

pub struct TestGunzipFilter {
    verifier: GzDecoder<Vec<u8>>,
}

impl TestGunzipFilter {
    #[must_use]
    pub fn new() -> Self {
        Self { verifier: GzDecoder::new(Vec::new()) }
    }
}

impl Default for TestGunzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for TestGunzipFilter {
    fn name(&self) -> &'static str {
        "testgunzip"
    }

    fn bytes(&mut self, action: Action, data: &[u8], out: &mut Vec<u8>) -> Result<Action, FilterError> {
        self.verifier
            .write_all(data)
            .map_err(|e| FilterError::Malformed(format!("object claims gzip but isn't: {e}")))?;
        out.extend_from_slice(data);
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::gzip::GzipFilter;

    #[test]
    fn passes_through_valid_gzip_unchanged() {
        let mut gz = GzipFilter::new();
        let mut compressed = Vec::new();
        gz.bytes(Action::End, b"payload", &mut compressed).unwrap();

        let mut test = TestGunzipFilter::new();
        let mut out = Vec::new();
        test.bytes(Action::End, &compressed, &mut out).unwrap();
        assert_eq!(out, compressed);
    }

    #[test]
    fn rejects_non_gzip_bytes() {
        let mut test = TestGunzipFilter::new();
        let mut out = Vec::new();
        assert!(test.bytes(Action::End, b"not gzip at all", &mut out).is_err());
    }
}
