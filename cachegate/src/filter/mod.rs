//! VFP/VDP filter pipeline (§4.3): dynamically composable byte-stream transforms.
pub mod esi;
pub mod gunzip;
pub mod gzip;
pub mod range;
pub mod testgunzip;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    Null,
    Flush,
    End,
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter {0} forwarded END more than once")]
    DoubleEnd(&'static str),
    #[error("malformed upstream data: {0}")]
    Malformed(String),
}

/// A single stage of the VFP/VDP chain. `bytes` is called once per upstream delivery; a filter
/// must forward exactly one `End` downstream (it may convert an incoming `End` into `Flush` if it
/// still has buffered bytes to emit from `fini`).
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    fn bytes(&mut self, action: Action, data: &[u8], out: &mut Vec<u8>) -> Result<Action, FilterError>;

    /// Emit any buffered tail bytes at end-of-chain teardown.
    fn fini(&mut self, _out: &mut Vec<u8>) -> Result<(), FilterError> {
        Ok(())
    }
}

/// An ordered chain of filters with a cursor; feeding one chunk through `push` runs it through
/// every stage front-to-back.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Box<dyn Filter>>,
}

impl Chain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stage(&mut self, stage: Box<dyn Filter>) {
        self.stages.push(stage);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `data` through every stage in order, returning the fully-transformed output and the
    /// terminal action observed at the tail.
    pub fn process(&mut self, action: Action, data: &[u8]) -> Result<(Bytes, Action), FilterError> {
        if self.stages.is_empty() {
            return Ok((Bytes::copy_from_slice(data), action));
        }
        let mut current_action = action;
        let mut current_data = data.to_vec();
        for stage in &mut self.stages {
            let mut out = Vec::new();
            current_action = stage.bytes(current_action, &current_data, &mut out)?;
            current_data = out;
        }
        Ok((Bytes::from(current_data), current_action))
    }

    pub fn finish(&mut self) -> Result<Bytes, FilterError> {
        let mut out = Vec::new();
        for stage in &mut self.stages {
            stage.fini(&mut out)?;
        }
        Ok(Bytes::from(out))
    }
}

/// Fetch-side default filter list resolution (§4.3): `beresp` carries `is_gzip`/`do_*` bits.
pub struct FetchDisposition {
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub is_gzip: bool,
    pub has_body: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub enum FetchStage {
    Gunzip,
    EsiGzip,
    Esi,
    Gzip,
    TestGunzip,
}

/// Resolve the default fetch-side filter list per the §4.3 decision table.
#[must_use]
pub fn resolve_fetch_list(d: &FetchDisposition) -> Vec<FetchStage> {
    if !d.has_body {
        return Vec::new();
    }
    if d.do_gunzip && d.is_gzip {
        return vec![FetchStage::Gunzip];
    }
    if d.do_esi && (d.do_gzip || (d.is_gzip && !d.do_gunzip)) {
        let mut list = vec![FetchStage::Gunzip];
        list.push(FetchStage::EsiGzip);
        return list;
    }
    if d.do_esi {
        let mut list = Vec::new();
        if d.is_gzip {
            list.push(FetchStage::Gunzip);
        }
        list.push(FetchStage::Esi);
        return list;
    }
    if d.do_gzip {
        return vec![FetchStage::Gzip];
    }
    if d.is_gzip && !d.do_gunzip {
        return vec![FetchStage::TestGunzip];
    }
    Vec::new()
}

/// Deliver-side default filter list resolution (§4.3).
pub struct DeliverDisposition {
    pub has_esi_data: bool,
    pub esi_enabled: bool,
    pub is_gzip: bool,
    pub client_accepts_gzip: bool,
    pub status_is_200: bool,
    pub request_has_range: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DeliverStage {
    Esi,
    Gunzip,
    Range,
}

/// Resolve the default deliver-side filter list. Matches are prepended in the order given in
/// §4.3, then the composed list is reversed into pipeline order.
#[must_use]
pub fn resolve_deliver_list(d: &DeliverDisposition) -> Vec<DeliverStage> {
    let mut prepended = Vec::new();
    if d.has_esi_data && d.esi_enabled {
        prepended.push(DeliverStage::Esi);
    }
    if d.is_gzip && !d.client_accepts_gzip {
        prepended.push(DeliverStage::Gunzip);
    }
    if d.status_is_200 && d.request_has_range {
        prepended.push(DeliverStage::Range);
    }
    prepended.reverse();
    prepended
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_list_empty_without_body() {
        let d = FetchDisposition { do_gzip: true, do_gunzip: true, do_esi: true, is_gzip: true, has_body: false };
        assert!(resolve_fetch_list(&d).is_empty());
    }

    #[test]
    fn fetch_list_prefers_gunzip_when_both_set() {
        let d = FetchDisposition { do_gzip: false, do_gunzip: true, do_esi: false, is_gzip: true, has_body: true };
        assert_eq!(resolve_fetch_list(&d), vec![FetchStage::Gunzip]);
    }

    #[test]
    fn fetch_list_esi_without_gzip_flags() {
        let d = FetchDisposition { do_gzip: false, do_gunzip: false, do_esi: true, is_gzip: false, has_body: true };
        assert_eq!(resolve_fetch_list(&d), vec![FetchStage::Esi]);
    }

    #[test]
    fn deliver_list_orders_esi_gunzip_range() {
        let d = DeliverDisposition {
            has_esi_data: true,
            esi_enabled: true,
            is_gzip: true,
            client_accepts_gzip: false,
            status_is_200: true,
            request_has_range: true,
        };
        assert_eq!(
            resolve_deliver_list(&d),
            vec![DeliverStage::Range, DeliverStage::Gunzip, DeliverStage::Esi]
        );
    }
}
