//! JPIP request query-string construction and server reply-header
//! parsing.

use crate::error::{Error, Result};
use crate::request::ChunkGap;
use crate::woi::{Range, RoundDirection, WindowOfInterest};

const MAX_NAME_BYTES_DEFAULT: usize = 64 * 1024;

pub fn encode_hex_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 2);
    for b in name.as_bytes() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Decodes a hex-encoded name, rejecting anything `>= max_bytes` so an
/// oversized field can't be used to force unbounded allocation.
pub fn decode_hex_name(hex: &str, max_bytes: usize) -> Result<String> {
    if hex.len() / 2 >= max_bytes {
        return Err(Error::NameTooLarge(hex.len() / 2, max_bytes));
    }
    if hex.len() % 2 != 0 {
        return Err(Error::MalformedResponse("odd-length hex name".into()));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<char> = hex.chars().collect();
    for pair in chars.chunks(2) {
        let s: String = pair.iter().collect();
        let b = u8::from_str_radix(&s, 16)
            .map_err(|_| Error::MalformedResponse("invalid hex digit in name".into()))?;
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| Error::MalformedResponse("name is not valid UTF-8".into()))
}

fn format_range(r: &Range) -> String {
    if r.first == r.last {
        if r.step > 1 {
            format!("{}:{}", r.first, r.step)
        } else {
            format!("{}", r.first)
        }
    } else if r.step > 1 {
        format!("{}-{}:{}", r.first, r.last, r.step)
    } else {
        format!("{}-{}", r.first, r.last)
    }
}

fn format_ranges(ranges: &[Range]) -> String {
    ranges.iter().map(format_range).collect::<Vec<_>>().join(",")
}

/// Incrementally assembles one JPIP request's query string, field by
/// field, appending directly into the output buffer as each field is
/// added rather than building up an intermediate structure first.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    fields: Vec<String>,
}

impl QueryBuilder {
    pub fn new() -> QueryBuilder {
        QueryBuilder::default()
    }

    pub fn target(&mut self, name: &str) -> &mut Self {
        self.fields.push(format!("target={}", name));
        self
    }

    pub fn subtarget(&mut self, name: &str) -> &mut Self {
        self.fields.push(format!("subtarget={}", name));
        self
    }

    pub fn tid(&mut self, id: Option<&str>) -> &mut Self {
        self.fields.push(format!("tid={}", id.unwrap_or("0")));
        self
    }

    pub fn stream_type_jpp(&mut self) -> &mut Self {
        self.fields.push("type=jpp-stream".to_string());
        self
    }

    pub fn cid(&mut self, id: &str) -> &mut Self {
        self.fields.push(format!("cid={}", id));
        self
    }

    pub fn cnew(&mut self, transports: &[&str]) -> &mut Self {
        self.fields.push(format!("cnew={}", transports.join(",")));
        self
    }

    pub fn cclose(&mut self, id: &str) -> &mut Self {
        self.fields.push(format!("cclose={}", id));
        self
    }

    pub fn qid(&mut self, n: u64) -> &mut Self {
        self.fields.push(format!("qid={}", n));
        self
    }

    pub fn barrier(&mut self, qid: u64) -> &mut Self {
        self.fields.push(format!("barrier={}", qid));
        self
    }

    pub fn preferences(&mut self, hex: &str) -> &mut Self {
        self.fields.push(format!("pref={}", hex));
        self
    }

    pub fn woi(&mut self, woi: &WindowOfInterest) -> &mut Self {
        let round = match woi.round {
            RoundDirection::RoundUp => ",round-up",
            RoundDirection::Closest => ",closest",
            RoundDirection::RoundDown => ",round-down",
        };
        self.fields.push(format!("fsiz={},{}{}", woi.full_size.0, woi.full_size.1, round));
        self.fields.push(format!("roff={},{}", woi.region_offset.0, woi.region_offset.1));
        self.fields.push(format!("rsiz={},{}", woi.region_size.0, woi.region_size.1));
        if !woi.components.is_empty() {
            self.fields.push(format!("comps={}", format_ranges(&woi.components)));
        }
        if !woi.codestreams.is_empty() {
            self.fields.push(format!("stream={}", format_ranges(&woi.codestreams)));
        }
        if !woi.contexts.is_empty() {
            let joined = woi.contexts.iter().map(|c| c.raw.clone()).collect::<Vec<_>>().join(",");
            self.fields.push(format!("context={}", encode_hex_name(&joined)));
        }
        if let Some(layers) = woi.max_layers {
            self.fields.push(format!("layers={}", layers));
        }
        if woi.byte_limit > 0 {
            self.fields.push(format!("len={}", woi.byte_limit));
        }
        if woi.wait_for_data {
            self.fields.push("wait=yes".to_string());
        }
        for meta in &woi.metadata {
            self.fields.push(format!("metareq={}", meta.0));
        }
        self
    }

    /// Appends a `model=` field for one codestream's descriptors.
    pub fn model(&mut self, stream: u64, descriptors: &[String]) -> &mut Self {
        if descriptors.is_empty() {
            return self;
        }
        self.fields.push(format!("model=[{}],{}", stream, descriptors.join(",")));
        self
    }

    /// `abandon=<qid>:seq_from[-seq_to],…` for one request's collapsed
    /// gap list.
    pub fn abandon(&mut self, qid: u64, gaps: &[ChunkGap]) -> &mut Self {
        if gaps.is_empty() {
            return self;
        }
        let ranges = gaps
            .iter()
            .map(|g| match g.to {
                Some(to) if to != g.from => format!("{}-{}", g.from, to),
                _ => format!("{}", g.from),
            })
            .collect::<Vec<_>>()
            .join(",");
        self.fields.push(format!("abandon={}:{}", qid, ranges));
        self
    }

    pub fn build(&self) -> String {
        self.fields.join("&")
    }
}

/// Parsed `JPIP-cnew` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CNewHeader {
    pub cid: Option<String>,
    pub transport: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auxport: Option<u16>,
    pub path: Option<String>,
}

/// Parses the `cid=…,transport=…,host=…,…` comma-separated sub-field
/// syntax of `JPIP-cnew`.
pub fn parse_cnew(value: &str) -> Result<CNewHeader> {
    let mut h = CNewHeader::default();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        match k {
            "cid" => h.cid = Some(v.to_string()),
            "transport" => h.transport = Some(v.to_string()),
            "host" => h.host = Some(v.to_string()),
            "path" => h.path = Some(v.to_string()),
            "port" => {
                h.port = Some(v.parse().map_err(|_| {
                    Error::MalformedResponse("JPIP-cnew port is not numeric".into())
                })?)
            }
            "auxport" => {
                h.auxport = Some(v.parse().map_err(|_| {
                    Error::MalformedResponse("JPIP-cnew auxport is not numeric".into())
                })?)
            }
            _ => {}
        }
    }
    if h.cid.is_none() {
        return Err(Error::MalformedResponse("JPIP-cnew missing cid parameter".into()));
    }
    Ok(h)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hex = encode_hex_name("image.jpx");
        assert_eq!(decode_hex_name(&hex, MAX_NAME_BYTES_DEFAULT).unwrap(), "image.jpx");
    }

    #[test]
    fn name_too_large_is_rejected() {
        let huge = "ab".repeat(70 * 1024);
        assert!(matches!(decode_hex_name(&huge, 64 * 1024), Err(Error::NameTooLarge(..))));
    }

    #[test]
    fn woi_query_roundish() {
        let mut woi = WindowOfInterest::full_image(1024, 1024);
        woi.region_offset = (10, 20);
        woi.region_size = (100, 200);
        let mut b = QueryBuilder::new();
        b.target("image.jp2").tid(None).stream_type_jpp().woi(&woi);
        let q = b.build();
        assert!(q.contains("fsiz=1024,1024,closest"));
        assert!(q.contains("roff=10,20"));
        assert!(q.contains("rsiz=100,200"));
    }

    #[test]
    fn parse_cnew_header() {
        let h = parse_cnew("cid=C1,transport=http-tcp,host=same,port=80,auxport=81").unwrap();
        assert_eq!(h.cid.as_deref(), Some("C1"));
        assert_eq!(h.port, Some(80));
        assert_eq!(h.auxport, Some(81));
    }

    #[test]
    fn parse_cnew_missing_cid_is_malformed() {
        assert!(parse_cnew("transport=http-tcp").is_err());
    }

    #[test]
    fn abandon_field_collapses_single_point_gap() {
        let mut b = QueryBuilder::new();
        b.abandon(1, &[ChunkGap { from: 1, to: Some(1) }]);
        assert_eq!(b.build(), "abandon=1:1");
    }
}
