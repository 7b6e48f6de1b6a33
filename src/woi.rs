//! Window of interest.

/// How the server should round a requested resolution that doesn't match
/// an available DWT level exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    RoundUp,
    Closest,
    RoundDown,
}

/// An inclusive component or codestream range, `a[-b][:step]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub first: u32,
    pub last: u32,
    pub step: u32,
}

impl Range {
    pub fn single(v: u32) -> Range {
        Range { first: v, last: v, step: 1 }
    }
}

/// One `context=` entry: a codestream-context remapping (MJ2 track, JPX
/// entity, etc) together with the id the server should use in its replies.
///
/// The MJ2 "+now" suffix is round-tripped verbatim rather than
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMapping {
    pub raw: String,
    pub remapping_id: Option<u32>,
}

/// A metadata request descriptor (`metareq=` in kdu_client; folded into
/// `model=`/`context=` machinery upstream of this engine, but tracked here
/// as an opaque string since its internal grammar is out of scope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRequest(pub String);

/// Region/resolution/component/quality descriptor the application is
/// interested in.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOfInterest {
    pub full_size: (u32, u32),
    pub region_offset: (u32, u32),
    pub region_size: (u32, u32),
    pub components: Vec<Range>,
    pub codestreams: Vec<Range>,
    pub contexts: Vec<ContextMapping>,
    pub max_layers: Option<u32>,
    pub metadata: Vec<MetaRequest>,
    pub round: RoundDirection,
    /// `len=` -- a byte limit scoped to this specific WOI, separate from
    /// the flow regulator's `Lmax` (that gates the *pacing*, this caps
    /// the *total* for this window only).
    pub byte_limit: u64,
    /// `wait=yes` -- ask the server to hold the connection open until new
    /// data for this window is available.
    pub wait_for_data: bool,
}

impl WindowOfInterest {
    pub fn full_image(width: u32, height: u32) -> WindowOfInterest {
        WindowOfInterest {
            full_size: (width, height),
            region_offset: (0, 0),
            region_size: (width, height),
            components: Vec::new(),
            codestreams: Vec::new(),
            contexts: Vec::new(),
            max_layers: None,
            metadata: Vec::new(),
            round: RoundDirection::Closest,
            byte_limit: 0,
            wait_for_data: false,
        }
    }

    /// Whether `other` is entirely contained in `self` -- used by
    /// `post_window`'s subsumption check (a strictly later
    /// complete-and-trusted request whose WOI contains an older one
    /// retires it outright).
    pub fn contains(&self, other: &WindowOfInterest) -> bool {
        let (ox, oy) = other.region_offset;
        let (ow, oh) = other.region_size;
        let (sx, sy) = self.region_offset;
        let (sw, sh) = self.region_size;
        self.full_size == other.full_size
            && sx <= ox && sy <= oy
            && sx + sw >= ox + ow
            && sy + sh >= oy + oh
            && (self.max_layers.is_none() || self.max_layers >= other.max_layers)
            && self.components_superset_of(&other.components)
    }

    fn components_superset_of(&self, others: &[Range]) -> bool {
        if self.components.is_empty() {
            return true; // empty means "all components"
        }
        others.iter().all(|o| {
            self.components.iter().any(|s| s.first <= o.first && s.last >= o.last)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_window_contains_subregion() {
        let full = WindowOfInterest::full_image(1024, 1024);
        let mut sub = WindowOfInterest::full_image(1024, 1024);
        sub.region_offset = (10, 10);
        sub.region_size = (5, 5);
        assert!(full.contains(&sub));
        assert!(!sub.contains(&full));
    }
}
