//! Per-task bump arena.
//!
//! Mirrors the workspace ("ws") of the teacher codebase: a fixed-capacity scratch area handed to
//! each request/fetch task, used for header copies and small structs, and wiped in bulk at the
//! end of the task. Because this is safe Rust rather than C, allocations hand back an index-based
//! [`Span`] into the arena instead of a borrowed slice — that sidesteps the aliasing rules a
//! pointer-based bump allocator would otherwise need `unsafe` for, while keeping the same
//! "reserve / release / overflow-mark" semantics.
use std::ops::Range;

/// A `(begin, end)` pair into a [`Workspace`]'s backing buffer.
///
/// This is the direct analogue of the teacher's `txt { b, e }` pointer pair, made index-based so
/// it stays `Copy` and outlives no borrow of the arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub const EMPTY: Span = Span { start: 0, end: 0 };

    #[must_use]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, Eq, PartialEq)]
pub enum WsError {
    #[error("workspace overflow: requested {requested} bytes, {available} available")]
    Overflow { requested: usize, available: usize },
}

/// A bump-allocated scratch arena with a fixed capacity, wiped at task end.
///
/// Overflow is non-fatal and recoverable: the arena is marked and every subsequent allocation
/// call keeps failing until somebody calls [`Workspace::release`] back to an earlier mark (or the
/// whole workspace is dropped at task end). Callers are expected to check [`Workspace::overflowed`]
/// and turn it into a client-visible error rather than panicking.
pub struct Workspace {
    buf: Vec<u8>,
    cap: usize,
    overflowed: bool,
}

/// An in-progress allocation that has not yet been committed to a final length.
///
/// Mirrors `WS_Reserve`/`WS_Release`: grab up to `limit` bytes, write into them, then commit only
/// the prefix actually used.
pub struct Reservation {
    start: u32,
    limit: u32,
}

impl Workspace {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Workspace {
            buf: Vec::with_capacity(cap),
            cap,
            overflowed: false,
        }
    }

    /// Snapshot the current high-water mark, to be restored with [`Workspace::release`].
    #[must_use]
    pub fn mark(&self) -> usize {
        self.buf.len()
    }

    /// Roll the arena back to an earlier mark, freeing everything allocated since. Also clears
    /// the overflow flag: a nested scope that overflowed can still be retried by its caller after
    /// release.
    pub fn release(&mut self, mark: usize) {
        self.buf.truncate(mark);
        self.overflowed = false;
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn alloc(&mut self, n: usize) -> Result<Span, WsError> {
        let used = self.buf.len();
        if used.saturating_add(n) > self.cap {
            self.overflowed = true;
            return Err(WsError::Overflow {
                requested: n,
                available: self.cap.saturating_sub(used),
            });
        }
        let start = used as u32;
        self.buf.resize(used + n, 0);
        Ok(Span {
            start,
            end: start + n as u32,
        })
    }

    pub fn copy_bytes(&mut self, src: &[u8]) -> Result<Span, WsError> {
        let span = self.alloc(src.len())?;
        self.buf[span.range()].copy_from_slice(src);
        Ok(span)
    }

    pub fn copy_str(&mut self, src: &str) -> Result<Span, WsError> {
        self.copy_bytes(src.as_bytes())
    }

    #[must_use]
    pub fn get(&self, span: Span) -> &[u8] {
        &self.buf[span.range()]
    }

    #[must_use]
    pub fn get_str(&self, span: Span) -> &str {
        std::str::from_utf8(self.get(span)).unwrap_or_default()
    }

    /// Reserve up to `limit` bytes without committing a final length yet.
    pub fn reserve(&mut self, limit: usize) -> Result<Reservation, WsError> {
        let used = self.buf.len();
        if used.saturating_add(limit) > self.cap {
            self.overflowed = true;
            return Err(WsError::Overflow {
                requested: limit,
                available: self.cap.saturating_sub(used),
            });
        }
        self.buf.resize(used + limit, 0);
        Ok(Reservation {
            start: used as u32,
            limit: limit as u32,
        })
    }

    /// Write access into a live reservation, for incremental fills (e.g. building a header value
    /// piece by piece before knowing its final length).
    pub fn reservation_buf(&mut self, res: &Reservation) -> &mut [u8] {
        &mut self.buf[res.start as usize..(res.start + res.limit) as usize]
    }

    /// Commit a reservation, shrinking it down to the `used` prefix that was actually written.
    pub fn commit(&mut self, res: Reservation, used: usize) -> Span {
        debug_assert!(used as u32 <= res.limit);
        let end = res.start + used as u32;
        self.buf.truncate(end as usize);
        Span {
            start: res.start,
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_overflow() {
        let mut ws = Workspace::new(32);
        let a = ws.alloc(16).unwrap();
        assert_eq!(a.len(), 16);
        let err = ws.alloc(32).unwrap_err();
        assert!(matches!(err, WsError::Overflow { .. }));
        assert!(ws.overflowed());
    }

    #[test]
    fn release_resets_overflow() {
        let mut ws = Workspace::new(16);
        let mark = ws.mark();
        assert!(ws.alloc(32).is_err());
        ws.release(mark);
        assert!(!ws.overflowed());
        assert!(ws.alloc(8).is_ok());
    }

    #[test]
    fn copy_roundtrip() {
        let mut ws = Workspace::new(64);
        let span = ws.copy_str(&"hello").unwrap();
        assert_eq!(ws.get_str(span), "hello");
    }

    #[test]
    fn reservation_commit_shrinks() {
        let mut ws = Workspace::new(64);
        let res = ws.reserve(32).unwrap();
        ws.reservation_buf(&res)[..5].copy_from_slice(b"abcde");
        let span = ws.commit(res, 5);
        assert_eq!(ws.get(span), b"abcde");
        assert_eq!(ws.used(), 5);
    }
}
