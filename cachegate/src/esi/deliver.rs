//! Deliver-side ESI interpreter (§4.4.2/§4.4.3): executes the opcode program, splicing in
//! sub-request bodies and re-stitching gzip framing.
//!
//! Gzip re-stitching here always goes through the "copy-block" fallback (§4.4.2's handling for a
//! non-gzip child spliced into a gzip parent), applied uniformly to every verbatim run and every
//! included body once fully inflated. This keeps the splice correct (P6) without reimplementing
//! a raw-DEFLATE-block splicer; see `DESIGN.md` for the tradeoff against the original's
//! bit-exact block reuse.
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use cachegate_core::esi::{decode, EsiOp};
use cachegate_core::gzip::{GzipSplicer, GZIP_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum EsiDeliverError {
    #[error("esi program malformed: {0}")]
    Program(#[from] cachegate_core::esi::EsiError),
    #[error("esi include depth exceeded max_esi_depth={0}")]
    DepthExceeded(u32),
    #[error("esi include of {0:?} failed: {1}")]
    IncludeFailed(String, String),
    #[error("verbatim/skip run extends past backing storage")]
    Truncated,
}

/// Fetches an included fragment's already-rendered (possibly further ESI-processed) body, plus
/// whether it was itself a gzip response. This is the "re-embark" seam (§4.4.3): the real engine
/// wires this to the CNT dispatcher; tests wire it to a canned map.
pub type IncludeFetcher<'a> = dyn Fn(&str, Option<&str>) -> Pin<Box<dyn Future<Output = Result<(Bytes, bool), String>> + Send>>
    + Send
    + Sync
    + 'a;

pub struct Deliverer<'a> {
    pub max_depth: u32,
    pub fetch_include: &'a IncludeFetcher<'a>,
}

impl<'a> Deliverer<'a> {
    /// Execute `program` against `backing` (the stored, already-inflated object body the
    /// verbatim/skip runs index into), producing the final delivered bytes. Re-wraps the output
    /// in its own gzip framing when the program starts with a `GzipMarker`.
    pub async fn run(&self, program: &[u8], backing: &[u8]) -> Result<Bytes, EsiDeliverError> {
        self.run_with_wrap(program, backing, true).await
    }

    /// Like `run`, but never re-wraps the output in gzip framing, even if the program starts
    /// with a `GzipMarker` — used to render an include target into the plain bytes its parent's
    /// own splicer will copy-block into the one enclosing gzip member (§4.4.2).
    pub async fn run_inline(&self, program: &[u8], backing: &[u8]) -> Result<Bytes, EsiDeliverError> {
        self.run_with_wrap(program, backing, false).await
    }

    async fn run_with_wrap(&self, program: &[u8], backing: &[u8], wrap_gzip: bool) -> Result<Bytes, EsiDeliverError> {
        let ops = decode(program)?;
        let has_marker = matches!(ops.first(), Some(EsiOp::GzipMarker));
        let is_gzip = wrap_gzip && has_marker;
        let ops = if has_marker { &ops[1..] } else { &ops[..] };

        let mut out = Vec::new();
        let mut splicer = is_gzip.then(GzipSplicer::new);
        if is_gzip {
            out.extend_from_slice(&GZIP_HEADER);
        }

        let mut cursor = 0usize;
        self.run_ops(ops, backing, &mut cursor, &mut out, &mut splicer, 0).await?;

        if let Some(splicer) = splicer {
            out.extend_from_slice(&splicer.finish());
        }
        Ok(Bytes::from(out))
    }

    fn run_ops<'b>(
        &'b self,
        ops: &'b [EsiOp],
        backing: &'b [u8],
        cursor: &'b mut usize,
        out: &'b mut Vec<u8>,
        splicer: &'b mut Option<GzipSplicer>,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), EsiDeliverError>> + Send + 'b>>
    where
        Self: Sync,
    {
        Box::pin(async move {
            for op in ops {
                match op {
                    EsiOp::Verbatim { len } => {
                        let len = *len as usize;
                        let end = cursor.checked_add(len).ok_or(EsiDeliverError::Truncated)?;
                        let chunk = backing.get(*cursor..end).ok_or(EsiDeliverError::Truncated)?;
                        emit(out, splicer, chunk);
                        *cursor = end;
                    }
                    EsiOp::Skip { len } => {
                        *cursor = cursor.checked_add(*len as usize).ok_or(EsiDeliverError::Truncated)?;
                    }
                    EsiOp::Crc32 { .. } => {}
                    EsiOp::GzipMarker => {}
                    EsiOp::Include { src, host } | EsiOp::IncludeAbort { src, host } => {
                        let abort_on_fail = matches!(op, EsiOp::IncludeAbort { .. });
                        if depth + 1 > self.max_depth {
                            return Err(EsiDeliverError::DepthExceeded(self.max_depth));
                        }
                        match (self.fetch_include)(src, host.as_deref()).await {
                            Ok((body, _child_is_gzip)) => {
                                emit(out, splicer, &body);
                            }
                            Err(e) => {
                                if abort_on_fail {
                                    return Err(EsiDeliverError::IncludeFailed(src.clone(), e));
                                }
                                // onerror=continue: swallow and move on (§4.4.2).
                            }
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn emit(out: &mut Vec<u8>, splicer: &mut Option<GzipSplicer>, chunk: &[u8]) {
    match splicer {
        Some(s) => out.extend_from_slice(&s.copy_block(chunk)),
        None => out.extend_from_slice(chunk),
    }
}

/// Convenience entry point for callers with a fixed include map (used by tests and simple
/// single-level delivery).
pub async fn deliver<'a>(
    program: &[u8],
    backing: &[u8],
    max_depth: u32,
    fetch_include: &'a IncludeFetcher<'a>,
) -> Result<Bytes, EsiDeliverError> {
    let d = Deliverer { max_depth, fetch_include };
    d.run(program, backing).await
}

/// Convenience entry point mirroring `deliver`, but via `Deliverer::run_inline` — for rendering
/// an include target rather than a top-level response.
pub async fn deliver_inline<'a>(
    program: &[u8],
    backing: &[u8],
    max_depth: u32,
    fetch_include: &'a IncludeFetcher<'a>,
) -> Result<Bytes, EsiDeliverError> {
    let d = Deliverer { max_depth, fetch_include };
    d.run_inline(program, backing).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esi::parser;
    use std::io::Read;

    fn plain_fetcher<'a>() -> Box<IncludeFetcher<'a>> {
        Box::new(|src, _host| {
            let src = src.to_string();
            Box::pin(async move {
                if src == "/c" {
                    Ok((Bytes::from_static(b"CCC"), false))
                } else {
                    Err("not found".into())
                }
            })
        })
    }

    #[tokio::test]
    async fn plain_include_splice() {
        let backing = b"AAA<esi:include src=\"/c\" onerror=\"continue\"/>BBB";
        let ops = parser::parse(backing, false);
        let program = cachegate_core::esi::encode(&ops);
        let fetcher = plain_fetcher();
        let out = deliver(&program, backing, 5, &fetcher).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"AAACCCBBB"));
    }

    #[tokio::test]
    async fn gzip_splice_is_a_valid_member_decompressing_to_expected_content() {
        let backing = b"AAA<esi:include src=\"/c\" onerror=\"continue\"/>BBB";
        let ops = parser::parse(backing, true);
        let program = cachegate_core::esi::encode(&ops);
        let fetcher = plain_fetcher();
        let out = deliver(&program, backing, 5, &fetcher).await.unwrap();

        let mut decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"AAACCCBBB");
    }

    #[tokio::test]
    async fn include_abort_propagates_failure() {
        let backing = b"<esi:include src=\"/missing\"/>";
        let ops = parser::parse(backing, false);
        let program = cachegate_core::esi::encode(&ops);
        let fetcher = plain_fetcher();
        let result = deliver(&program, backing, 5, &fetcher).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn include_continue_swallows_failure() {
        let backing = b"A<esi:include src=\"/missing\" onerror=\"continue\"/>B";
        let ops = parser::parse(backing, false);
        let program = cachegate_core::esi::encode(&ops);
        let fetcher = plain_fetcher();
        let out = deliver(&program, backing, 5, &fetcher).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"AB"));
    }

    #[tokio::test]
    async fn depth_limit_is_enforced() {
        let backing = b"<esi:include src=\"/c\"/>";
        let ops = parser::parse(backing, false);
        let program = cachegate_core::esi::encode(&ops);
        let fetcher = plain_fetcher();
        let result = deliver(&program, backing, 0, &fetcher).await;
        assert!(matches!(result, Err(EsiDeliverError::DepthExceeded(0))));
    }
}
