//! `gzip` VFP/VDP stage: compress a byte stream, used on the fetch side when `do_gzip` is set and
//! the backend response arrived uncompressed.
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use super::{Action, Filter, FilterError};

pub struct GzipFilter {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipFilter {
    #[must_use]
    pub fn new() -> Self {
        Self { encoder: Some(GzEncoder::new(Vec::new(), Compression::default())) }
    }
}

impl Default for GzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for GzipFilter {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn bytes(&mut self, action: Action, data: &[u8], out: &mut Vec<u8>) -> Result<Action, FilterError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(FilterError::DoubleEnd("gzip"));
        };
        encoder
            .write_all(data)
            .map_err(|e| FilterError::Malformed(e.to_string()))?;

        if action == Action::End {
            let encoder = self.encoder.take().unwrap();
            let finished = encoder.finish().map_err(|e| FilterError::Malformed(e.to_string()))?;
            out.extend_from_slice(&finished);
            return Ok(Action::End);
        }
        if action == Action::Flush {
            encoder.flush().map_err(|e| FilterError::Malformed(e.to_string()))?;
        }
        Ok(Action::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_a_valid_gzip_member() {
        let mut f = GzipFilter::new();
        let mut out = Vec::new();
        f.bytes(Action::End, b"hello world", &mut out).unwrap();
        assert_eq!(&out[0..2], &[0x1f, 0x8b]);
        let mut decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded, b"hello world");
    }
}
