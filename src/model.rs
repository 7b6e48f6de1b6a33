//! Cache-model signalling.
//!
//! Computing which data-bins are "relevant" to a WOI requires re-running
//! the JPEG2000 resolution/tile/precinct mapping against a skeleton
//! codestream built from the main-header bin -- that's the codestream
//! mapping library, an external collaborator out of scope for this
//! engine. We depend on it through the [`CodestreamMapper`] trait only.

use std::collections::HashMap;

use crate::databin::{BinClass, Cache, DataBinId};
use crate::woi::WindowOfInterest;

pub trait CodestreamMapper {
    /// Returns every data-bin relevant to `woi` within codestream
    /// `codestream_id`, given that codestream's main-header bytes.
    fn relevant_databins(
        &self,
        codestream_id: u64,
        woi: &WindowOfInterest,
        main_header: &[u8],
    ) -> Vec<DataBinId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentState {
    Partial(u64),
    Complete,
}

/// Per-CID (one instance tracks what's been told to one server session).
#[derive(Debug, Default)]
pub struct ModelManager {
    sent: HashMap<DataBinId, SentState>,
}

#[derive(Debug, Default)]
pub struct ModelOutput {
    /// One descriptor per relevant, changed data-bin, e.g. `"P12:400"` or
    /// `"-Hm0"`. Grouped by codestream id by the caller (`query` module),
    /// which needs the grouping to build `model=` fields.
    pub statements: Vec<(u64, String)>,
    pub truncated: bool,
}

impl ModelManager {
    pub fn new() -> ModelManager {
        ModelManager::default()
    }

    /// Builds the set of model statements to attach to a request for
    /// `woi`. `main_headers` supplies each codestream's main-header bytes
    /// (needed by the mapper); `dirty` reports whether the cache has any
    /// unreported change for a codestream (forces a rescan even when the
    /// WOI itself wouldn't otherwise touch it, matching "any mark is set
    /// on c").
    pub fn statements_for_request(
        &mut self,
        cache: &dyn Cache,
        mapper: &dyn CodestreamMapper,
        woi: &WindowOfInterest,
        codestream_ids: &[u64],
        main_headers: &HashMap<u64, Vec<u8>>,
        stateless: bool,
        dirty: impl Fn(u64) -> bool,
        byte_limit: usize,
    ) -> ModelOutput {
        let mut out = ModelOutput::default();
        let mut budget = byte_limit;

        for &c in codestream_ids {
            if !(stateless || dirty(c)) {
                continue;
            }
            let empty = Vec::new();
            let header = main_headers.get(&c).unwrap_or(&empty);
            let relevant = mapper.relevant_databins(c, woi, header);
            self.emit_for(cache, relevant, c, &mut out, &mut budget);
        }

        // Metadata bins are always scanned, codestream 0, regardless of
        // dirtiness.
        let metadata_ids: Vec<DataBinId> = cache
            .iter()
            .filter(|(id, _)| id.class == BinClass::Metadata)
            .map(|(id, _)| *id)
            .collect();
        self.emit_for(cache, metadata_ids, 0, &mut out, &mut budget);

        out
    }

    fn emit_for(
        &mut self,
        cache: &dyn Cache,
        ids: Vec<DataBinId>,
        stream_key: u64,
        out: &mut ModelOutput,
        budget: &mut usize,
    ) {
        for id in ids {
            match cache.get(&id) {
                None => {
                    if self.sent.remove(&id).is_some() {
                        self.push(out, budget, stream_key, format!("-{}{}", id.class.code(), id.bin_id));
                    }
                }
                Some(bin) => {
                    let state = if bin.is_complete {
                        SentState::Complete
                    } else {
                        SentState::Partial(bin.bytes.len() as u64)
                    };
                    if self.sent.get(&id) == Some(&state) {
                        continue;
                    }
                    let descriptor = match state {
                        SentState::Complete => format!("{}{}", id.class.code(), id.bin_id),
                        SentState::Partial(n) => format!("{}{}:{}", id.class.code(), id.bin_id, n),
                    };
                    self.sent.insert(id, state);
                    self.push(out, budget, stream_key, descriptor);
                }
            }
        }
    }

    fn push(&mut self, out: &mut ModelOutput, budget: &mut usize, stream_key: u64, descriptor: String) {
        if out.truncated {
            return;
        }
        let cost = descriptor.len() + 1;
        if cost > *budget {
            out.truncated = true;
            return;
        }
        *budget -= cost;
        out.statements.push((stream_key, descriptor));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::databin::MemoryCache;

    struct AllBins(Vec<DataBinId>);
    impl CodestreamMapper for AllBins {
        fn relevant_databins(&self, _c: u64, _woi: &WindowOfInterest, _h: &[u8]) -> Vec<DataBinId> {
            self.0.clone()
        }
    }

    #[test]
    fn emits_complete_without_byte_count() {
        let mut cache = MemoryCache::new();
        let id = DataBinId::new(BinClass::Precinct, 0, 7);
        cache.add_to_databin(id, 0, b"data", true);
        let mapper = AllBins(vec![id]);
        let mut mgr = ModelManager::new();
        let headers = HashMap::new();
        let out = mgr.statements_for_request(
            &cache,
            &mapper,
            &WindowOfInterest::full_image(1, 1),
            &[0],
            &headers,
            true,
            |_| false,
            16_000,
        );
        assert_eq!(out.statements, vec![(0, "P7".to_string())]);
    }

    #[test]
    fn truncates_when_over_budget() {
        let mut cache = MemoryCache::new();
        let ids: Vec<_> = (0..5).map(|i| DataBinId::new(BinClass::Precinct, 0, i)).collect();
        for &id in &ids {
            cache.add_to_databin(id, 0, b"x", false);
        }
        let mapper = AllBins(ids);
        let mut mgr = ModelManager::new();
        let headers = HashMap::new();
        let out = mgr.statements_for_request(
            &cache,
            &mapper,
            &WindowOfInterest::full_image(1, 1),
            &[0],
            &headers,
            true,
            |_| false,
            5,
        );
        assert!(out.truncated);
    }
}
