//! `gunzip` VFP/VDP stage: decompress a gzip byte stream (used on the fetch side when
//! `do_gunzip` is set, and on the deliver side when the client didn't advertise gzip support).
use flate2::write::GzDecoder;
use std::io::Write;

use super::{Action, Filter, FilterError};

pub struct GunzipFilter {
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GunzipFilter {
    #[must_use]
    pub fn new() -> Self {
        Self { decoder: Some(GzDecoder::new(Vec::new())) }
    }
}

impl Default for GunzipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for GunzipFilter {
    fn name(&self) -> &'static str {
        "gunzip"
    }

    fn bytes(&mut self, action: Action, data: &[u8], out: &mut Vec<u8>) -> Result<Action, FilterError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(FilterError::DoubleEnd("gunzip"));
        };
        decoder
            .write_all(data)
            .map_err(|e| FilterError::Malformed(format!("invalid gzip stream: {e}")))?;

        if action == Action::End {
            let decoder = self.decoder.take().unwrap();
            let finished = decoder.finish().map_err(|e| FilterError::Malformed(e.to_string()))?;
            out.extend_from_slice(&finished);
            return Ok(Action::End);
        }
        Ok(Action::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::gzip::GzipFilter;

    #[test]
    fn inverts_gzip_filter() {
        let mut gz = GzipFilter::new();
        let mut compressed = Vec::new();
        gz.bytes(Action::End, b"round trip me", &mut compressed).unwrap();

        let mut gunzip = GunzipFilter::new();
        let mut plain = Vec::new();
        gunzip.bytes(Action::End, &compressed, &mut plain).unwrap();
        assert_eq!(plain, b"round trip me");
    }
}
