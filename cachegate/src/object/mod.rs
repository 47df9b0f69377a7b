//! Object core / busy-object state machine and the in-process `Stevedore` store (§3, §3.1 ADDED).
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use cachegate_core::vary::VaryEntry;
use parking_lot::RwLock;
use tokio::sync::watch;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct ObjFlags: u8 {
        /// Hit-for-miss: a negative cache entry recording "don't bother re-fetching yet".
        const HIT_FOR_MISS = 0b0000_0001;
        const PRIVATE      = 0b0000_0010;
        const GZIPED       = 0b0000_0100;
        const FAILED       = 0b0000_1000;
        /// Body holds a compiled ESI opcode program (`crate::esi`) rather than literal bytes.
        const ESI_PROGRAM  = 0b0001_0000;
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("no space after {attempts} nuke attempts")]
    NoSpace { attempts: u32 },
    #[error("object not found")]
    NotFound,
}

/// One busy-object state, monotonically forward-only (§3).
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum BocState {
    ReqDone,
    PrepStream,
    Stream,
    Finished,
    Failed,
}

/// The in-progress side of an object being fetched.
pub struct Boc {
    state_tx: watch::Sender<BocState>,
    state_rx: watch::Receiver<BocState>,
    pub body: parking_lot::Mutex<Vec<Bytes>>,
}

impl Boc {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(BocState::ReqDone);
        Self { state_tx, state_rx, body: parking_lot::Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn state(&self) -> BocState {
        *self.state_rx.borrow()
    }

    /// Advance the state; panics (as a wrong-state assertion, §7 kind 9) if this would move
    /// the state machine backwards.
    pub fn advance(&self, next: BocState) {
        let cur = self.state();
        assert!(next >= cur, "boc state must advance monotonically: {cur:?} -> {next:?}");
        let _ = self.state_tx.send(next);
    }

    /// Block (async) until the state reaches at least `target`.
    pub async fn wait_state(&self, target: BocState) {
        let mut rx = self.state_rx.clone();
        while *rx.borrow() < target {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Boc {
    fn default() -> Self {
        Self::new()
    }
}

/// A refcounted handle to a cached object (§3).
pub struct ObjectCore {
    pub t_origin: SystemTime,
    pub ttl: Duration,
    pub grace: Duration,
    pub keep: Duration,
    pub flags: ObjFlags,
    pub hits: std::sync::atomic::AtomicU64,
    pub boc: Option<Arc<Boc>>,
    pub vary: Vec<VaryEntry>,
    /// Extended `Key:` matcher entries (§4.5 "Key (extended)"), parsed alongside `vary` but
    /// evaluated fresh against each lookup rather than frozen at store time — empty unless the
    /// backend sent a `Key:` header (and, for `Matcher` entries to actually apply, the
    /// `key-matcher` feature is enabled).
    pub key_entries: Vec<cachegate_core::key::KeyEntry>,
    pub headers: Vec<u8>,
    pub body: Bytes,
    /// When `flags` has `ESI_PROGRAM`, `body` holds the compiled opcode program and this holds
    /// the raw bytes its `Verbatim`/`Skip` runs index into; `None` otherwise.
    pub esi_backing: Option<Bytes>,
}

impl ObjectCore {
    /// Approximate stored footprint (headers + body), the unit `Stevedore`'s capacity accounting
    /// and nuke policy work in.
    #[must_use]
    pub fn stored_bytes(&self) -> u64 {
        (self.headers.len() + self.body.len() + self.esi_backing.as_ref().map_or(0, Bytes::len)) as u64
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.t_origin).map_or(true, |age| age > self.ttl)
    }

    #[must_use]
    pub fn is_within_grace(&self, now: SystemTime) -> bool {
        now.duration_since(self.t_origin)
            .map_or(false, |age| age <= self.ttl + self.grace)
    }

    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.t_origin).unwrap_or_default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Cache key: hashed request (method/host/path + Key: matcher context). The variant among
/// entries sharing an `ObjectKey` is picked by the Vary/Key matcher (§4.5).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ObjectKey(pub [u8; 32]);

impl ObjectKey {
    #[must_use]
    pub fn digest(method: &str, host: &str, path: &str) -> Self {
        let mut hasher = sha2_like_digest();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(host.as_bytes());
        hasher.update(b"\0");
        hasher.update(path.as_bytes());
        Self(hasher.finalize())
    }
}

/// A small FNV-1a-based stand-in keeps this module dependency-free; the endpoint/ident digest in
/// §4.1 explicitly only needs a stable, collision-resistant identifier, not cryptographic
/// properties.
struct FnvDigest {
    state: u64,
}

fn sha2_like_digest() -> FnvDigest {
    FnvDigest { state: 0xcbf2_9ce4_8422_2325 }
}

impl FnvDigest {
    fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= u64::from(b);
            self.state = self.state.wrapping_mul(0x0000_0100_0000_01B3);
        }
    }

    fn finalize(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..8].copy_from_slice(&self.state.to_be_bytes());
        out
    }
}

#[cfg(feature = "key-matcher")]
fn key_entries_match<'a>(
    stored: &[cachegate_core::key::KeyEntry],
    lookup: &mut impl FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
) -> bool {
    stored.is_empty()
        || matches!(cachegate_core::key::matches(stored, lookup), cachegate_core::key::KeyMatchResult::Same)
}

#[cfg(not(feature = "key-matcher"))]
fn key_entries_match<'a>(
    _stored: &[cachegate_core::key::KeyEntry],
    _lookup: &mut impl FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
) -> bool {
    true
}

/// Each cache key may have several stored variants, disambiguated by their Vary fingerprint.
#[derive(Default)]
struct Entry {
    variants: Vec<Arc<ObjectCore>>,
}

/// The in-process store standing in for the external stevedore collaborator (§3.1 ADDED):
/// `allocobj`/`getattr`/`setattr`/`wait_state` named exactly as the external-collaborator
/// contract describes, implemented here with no on-disk persistence. Unlike the real storage
/// engine (out of scope per spec.md's Non-goals — only its interface shape is consumed), this
/// stand-in still has to enforce *some* capacity so a long-running process doesn't grow without
/// bound, so it carries a byte budget and a simple nuke (LRU-by-hits) eviction policy (§7 error
/// kind 6).
pub struct Stevedore {
    entries: RwLock<HashMap<ObjectKey, Entry>>,
    capacity_bytes: u64,
    used_bytes: std::sync::atomic::AtomicU64,
    nuke_limit: u32,
}

impl Stevedore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX, 0)
    }

    #[must_use]
    pub fn with_capacity(capacity_bytes: u64, nuke_limit: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity_bytes,
            used_bytes: std::sync::atomic::AtomicU64::new(0),
            nuke_limit,
        }
    }

    /// Allocate and insert a new object variant under `key`, nuking the least-recently-useful
    /// variant across the whole store up to `nuke_limit` times if needed to make room (§7 error
    /// kind 6: "if a stevedore returns no space after `nuke_limit` attempts, fetch fails").
    pub fn allocobj(&self, key: ObjectKey, obj: ObjectCore) -> Result<Arc<ObjectCore>, StoreError> {
        let size = obj.stored_bytes();
        let mut attempts = 0;
        while self.used_bytes.load(std::sync::atomic::Ordering::Relaxed) + size > self.capacity_bytes {
            if attempts >= self.nuke_limit || !self.nuke_one() {
                return Err(StoreError::NoSpace { attempts });
            }
            attempts += 1;
        }
        let obj = Arc::new(obj);
        self.used_bytes.fetch_add(size, std::sync::atomic::Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.entry(key).or_default().variants.push(Arc::clone(&obj));
        Ok(obj)
    }

    /// Evict the variant with the fewest recorded hits across the whole store, freeing its
    /// accounted bytes. Returns `false` if there was nothing left to evict.
    fn nuke_one(&self) -> bool {
        let mut entries = self.entries.write();
        let victim = entries
            .iter()
            .flat_map(|(key, entry)| entry.variants.iter().enumerate().map(move |(i, v)| (key.clone(), i, v.clone())))
            .min_by_key(|(_, _, v)| v.hits.load(std::sync::atomic::Ordering::Relaxed));
        let Some((key, idx, victim)) = victim else { return false };
        if let Some(entry) = entries.get_mut(&key) {
            entry.variants.remove(idx);
            if entry.variants.is_empty() {
                entries.remove(&key);
            }
        }
        drop(entries);
        self.used_bytes.fetch_sub(victim.stored_bytes(), std::sync::atomic::Ordering::Relaxed);
        true
    }

    /// Find a variant matching the live request header lookup against each candidate's Vary
    /// fingerprint (§4.5).
    pub fn getattr<'a>(
        &self,
        key: &ObjectKey,
        mut lookup: impl FnMut(&str) -> Option<std::borrow::Cow<'a, str>>,
        gzip_support: bool,
    ) -> Option<Arc<ObjectCore>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        entry.variants.iter().find_map(|variant| {
            let vary_hit = matches!(
                cachegate_core::vary::matches(&variant.vary, &mut lookup, gzip_support),
                cachegate_core::vary::MatchResult::Same
            );
            (vary_hit && key_entries_match(&variant.key_entries, &mut lookup)).then(|| Arc::clone(variant))
        })
    }

    /// Replace the variant list for a key wholesale, e.g. after a cache purge or to refresh a
    /// hit-for-miss placeholder without letting repeated uncacheable fetches pile up variants.
    pub fn setattr(&self, key: ObjectKey, variants: Vec<Arc<ObjectCore>>) {
        let mut entries = self.entries.write();
        let added: u64 = variants.iter().map(|v| v.stored_bytes()).sum();
        let removed: u64 = entries.get(&key).map_or(0, |e| e.variants.iter().map(|v| v.stored_bytes()).sum());
        entries.insert(key, Entry { variants });
        drop(entries);
        let used = &self.used_bytes;
        used.fetch_add(added, std::sync::atomic::Ordering::Relaxed);
        used.fetch_sub(removed, std::sync::atomic::Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values().map(|e| e.variants.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Stevedore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boc_state_advances_monotonically() {
        let boc = Boc::new();
        assert_eq!(boc.state(), BocState::ReqDone);
        boc.advance(BocState::PrepStream);
        boc.advance(BocState::Stream);
        assert_eq!(boc.state(), BocState::Stream);
    }

    #[test]
    #[should_panic(expected = "must advance monotonically")]
    fn boc_state_rejects_backwards_transition() {
        let boc = Boc::new();
        boc.advance(BocState::Stream);
        boc.advance(BocState::ReqDone);
    }

    #[test]
    fn store_roundtrip_by_key() {
        let store = Stevedore::new();
        let key = ObjectKey::digest("GET", "example.com", "/x");
        let obj = ObjectCore {
            t_origin: SystemTime::now(),
            ttl: Duration::from_secs(60),
            grace: Duration::ZERO,
            keep: Duration::ZERO,
            flags: ObjFlags::empty(),
            hits: std::sync::atomic::AtomicU64::new(0),
            boc: None,
            vary: vec![],
            key_entries: vec![],
            headers: vec![],
            body: Bytes::from_static(b"hello"),
            esi_backing: None,
        };
        store.allocobj(key.clone(), obj).unwrap();
        let found = store.getattr(&key, |_| None, false);
        assert!(found.is_some());
        assert_eq!(found.unwrap().body, Bytes::from_static(b"hello"));
    }

    fn test_object(body: &'static [u8]) -> ObjectCore {
        ObjectCore {
            t_origin: SystemTime::now(),
            ttl: Duration::from_secs(60),
            grace: Duration::ZERO,
            keep: Duration::ZERO,
            flags: ObjFlags::empty(),
            hits: std::sync::atomic::AtomicU64::new(0),
            boc: None,
            vary: vec![],
            key_entries: vec![],
            headers: vec![],
            body: Bytes::from_static(body),
            esi_backing: None,
        }
    }

    #[test]
    fn allocobj_nukes_lowest_hit_variant_to_make_room() {
        let store = Stevedore::with_capacity(10, 4);
        let key_a = ObjectKey::digest("GET", "a.example", "/a");
        let key_b = ObjectKey::digest("GET", "b.example", "/b");

        let a = store.allocobj(key_a.clone(), test_object(b"12345")).unwrap();
        a.record_hit();
        a.record_hit();
        store.allocobj(key_b.clone(), test_object(b"67890")).unwrap();

        // Both fit exactly (10 bytes used of 10 capacity); a third insert has to nuke one.
        // `a` has more hits than the untouched `b`, so `b` (fewer hits) gets nuked.
        let key_c = ObjectKey::digest("GET", "c.example", "/c");
        store.allocobj(key_c.clone(), test_object(b"abcde")).unwrap();

        assert!(store.getattr(&key_a, |_| None, false).is_some());
        assert!(store.getattr(&key_b, |_| None, false).is_none());
        assert!(store.getattr(&key_c, |_| None, false).is_some());
    }

    #[test]
    fn allocobj_fails_with_no_space_once_nuke_limit_exhausted() {
        let store = Stevedore::with_capacity(4, 0);
        let key = ObjectKey::digest("GET", "x.example", "/x");
        let err = store.allocobj(key, test_object(b"12345")).unwrap_err();
        assert_eq!(err, StoreError::NoSpace { attempts: 0 });
    }

    #[test]
    fn setattr_replaces_variants_without_double_counting_capacity() {
        let store = Stevedore::with_capacity(20, 4);
        let key = ObjectKey::digest("GET", "x.example", "/x");
        store.allocobj(key.clone(), test_object(b"12345")).unwrap();
        store.setattr(key.clone(), vec![Arc::new(test_object(b"67890"))]);
        assert_eq!(store.len(), 1);
        // Capacity accounting tracked the replacement, not an accumulation: a second setattr of
        // the same size should still fit well within the 20-byte budget.
        store.setattr(key, vec![Arc::new(test_object(b"abcde"))]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn wait_state_resolves_once_advanced() {
        let boc = Arc::new(Boc::new());
        let waiter = {
            let boc = Arc::clone(&boc);
            tokio::spawn(async move {
                boc.wait_state(BocState::Stream).await;
            })
        };
        tokio::task::yield_now().await;
        boc.advance(BocState::PrepStream);
        boc.advance(BocState::Stream);
        waiter.await.unwrap();
    }
}
