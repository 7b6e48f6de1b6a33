//! On-disk cache file format: a plain-text header followed
//! by binary data-bin records, read back into an empty [`Cache`] or
//! written out of a live one.

use std::io::{self, Read, Write};

use crate::databin::{BinClass, Cache, DataBinId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CacheFileHeader {
    pub preamble: Option<Vec<u8>>,
    pub preamble_bins: Option<u32>,
    pub host: String,
    pub resource: String,
    pub target: String,
    pub sub_target: String,
    pub target_id: String,
}

fn read_line(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let Some(nl) = bytes[start..].iter().position(|&b| b == b'\n') else {
        return Err(Error::MalformedResponse("cache file header line not terminated".into()));
    };
    let line = std::str::from_utf8(&bytes[start..start + nl])
        .map_err(|_| Error::MalformedResponse("cache file header is not UTF-8".into()))?
        .to_string();
    *pos = start + nl + 1;
    Ok(line)
}

fn field(line: &str, name: &str) -> Result<String> {
    line.strip_prefix(name)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::MalformedResponse(format!("expected cache file field {}", name)))
}

/// Reads the header plus every data-bin record, inserting each bin into
/// `cache` via `add_to_databin`/`mark_databin` (cleared, since a loaded
/// bin has already been communicated to no one).
pub fn read(bytes: &[u8], cache: &mut dyn Cache) -> Result<CacheFileHeader> {
    let mut pos = 0usize;
    let magic = read_line(bytes, &mut pos)?;
    let mut header = CacheFileHeader::default();

    match magic.as_str() {
        "kjc/1.1" => {}
        "kjc/1.2" => {
            let pb_line = read_line(bytes, &mut pos)?;
            let preamble_bytes: usize = field(&pb_line, "Preamble-bytes:")?
                .parse()
                .map_err(|_| Error::MalformedResponse("invalid Preamble-bytes".into()))?;
            let bins_line = read_line(bytes, &mut pos)?;
            header.preamble_bins = Some(
                field(&bins_line, "Preamble-bins:")?
                    .parse()
                    .map_err(|_| Error::MalformedResponse("invalid Preamble-bins".into()))?,
            );
            if bytes.len() < pos + preamble_bytes {
                return Err(Error::MalformedResponse("cache file preamble truncated".into()));
            }
            header.preamble = Some(bytes[pos..pos + preamble_bytes].to_vec());
            pos += preamble_bytes;
        }
        other => return Err(Error::MalformedResponse(format!("unrecognised cache file magic {:?}", other))),
    }

    header.host = field(&read_line(bytes, &mut pos)?, "Host:")?;
    header.resource = field(&read_line(bytes, &mut pos)?, "Resource:")?;
    header.target = field(&read_line(bytes, &mut pos)?, "Target:")?;
    header.sub_target = field(&read_line(bytes, &mut pos)?, "Sub-target:")?;
    header.target_id = field(&read_line(bytes, &mut pos)?, "Target-id:")?;
    if header.target_id.len() > 255 {
        return Err(Error::MalformedResponse("Target-id exceeds 255 characters".into()));
    }

    while pos < bytes.len() {
        let (id, payload, is_complete) = read_record(bytes, &mut pos)?;
        cache.add_to_databin(id, 0, &payload, is_complete);
        cache.mark_databin(id, false);
    }

    Ok(header)
}

fn read_record(bytes: &[u8], pos: &mut usize) -> Result<(DataBinId, Vec<u8>, bool)> {
    let need = |p: usize, n: usize| -> Result<()> {
        if bytes.len() < p + n {
            Err(Error::MalformedResponse("cache file record truncated".into()))
        } else {
            Ok(())
        }
    };
    need(*pos, 2)?;
    let b0 = bytes[*pos];
    let b1 = bytes[*pos + 1];
    *pos += 2;
    let class = BinClass::from_wire((b0 >> 1) as u64);
    let is_complete = b0 & 1 != 0;
    let cs_bits = ((b1 >> 1) * 8) as usize;
    let id_bits_high = (b1 & 1) as usize;

    need(*pos, cs_bits / 8)?;
    let mut codestream_id: u64 = 0;
    for _ in 0..cs_bits / 8 {
        codestream_id = (codestream_id << 8) | bytes[*pos] as u64;
        *pos += 1;
    }

    // `id_bits` isn't separately encoded beyond the one carry bit packed
    // into b1; the remaining bin-id width is nibble-aligned to the next
    // byte boundary, matching the `cs_bits<<1 | (id_bits>>3)` packing.
    let id_bytes = 1 + id_bits_high;
    need(*pos, id_bytes)?;
    let mut bin_id: u64 = 0;
    for _ in 0..id_bytes {
        bin_id = (bin_id << 8) | bytes[*pos] as u64;
        *pos += 1;
    }

    need(*pos, 4)?;
    let len = u32::from_be_bytes([bytes[*pos], bytes[*pos + 1], bytes[*pos + 2], bytes[*pos + 3]]) as usize;
    *pos += 4;
    need(*pos, len)?;
    let payload = bytes[*pos..*pos + len].to_vec();
    *pos += len;

    Ok((DataBinId::new(class, codestream_id, bin_id), payload, is_complete))
}

/// Writes `header` plus every bin in `cache` in the `kjc/1.1` format (no
/// preamble support on write; `kjc/1.2` is a read-compatibility format
/// inherited from an older writer).
pub fn write(out: &mut impl Write, header: &CacheFileHeader, cache: &dyn Cache) -> io::Result<()> {
    write!(out, "kjc/1.1\n")?;
    write!(out, "Host:{}\n", header.host)?;
    write!(out, "Resource:{}\n", header.resource)?;
    write!(out, "Target:{}\n", header.target)?;
    write!(out, "Sub-target:{}\n", header.sub_target)?;
    write!(out, "Target-id:{}\n", header.target_id)?;

    for (id, bin) in cache.iter() {
        write_record(out, id, bin)?;
    }
    Ok(())
}

fn write_record(out: &mut impl Write, id: &DataBinId, bin: &crate::databin::DataBin) -> io::Result<()> {
    let b0 = ((id.class.to_wire() as u8) << 1) | (bin.is_complete as u8);
    let cs_bytes = bytes_needed(id.codestream_id);
    let cs_bits = (cs_bytes * 8) as u8;
    let id_bytes = bytes_needed(id.bin_id).max(1);
    let id_bits_high = if id_bytes > 1 { 1u8 } else { 0u8 };
    let b1 = ((cs_bits >> 3) << 1) | id_bits_high;
    out.write_all(&[b0, b1])?;
    out.write_all(&id.codestream_id.to_be_bytes()[8 - cs_bytes..])?;
    out.write_all(&id.bin_id.to_be_bytes()[8 - id_bytes..])?;
    out.write_all(&(bin.bytes.len() as u32).to_be_bytes())?;
    out.write_all(&bin.bytes)
}

fn bytes_needed(v: u64) -> usize {
    if v == 0 {
        1
    } else {
        ((64 - v.leading_zeros() as usize) + 7) / 8
    }
}

pub fn read_all(mut source: impl Read, cache: &mut dyn Cache) -> Result<CacheFileHeader> {
    let mut bytes = Vec::new();
    source
        .read_to_end(&mut bytes)
        .map_err(Error::Transport)?;
    read(&bytes, cache)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::databin::MemoryCache;

    #[test]
    fn round_trips_known_bins_and_target_id() {
        let mut src = MemoryCache::new();
        let id_a = DataBinId::new(BinClass::Precinct, 3, 12);
        let id_b = DataBinId::new(BinClass::MainHeader, 3, 0);
        src.add_to_databin(id_a, 0, b"precinct-bytes", true);
        src.add_to_databin(id_b, 0, b"header-bytes", false);

        let header = CacheFileHeader {
            preamble: None,
            preamble_bins: None,
            host: "example.org".into(),
            resource: "image.jp2".into(),
            target: "image.jp2".into(),
            sub_target: "".into(),
            target_id: "abc123".into(),
        };

        let mut buf = Vec::new();
        write(&mut buf, &header, &src).unwrap();

        let mut dst = MemoryCache::new();
        let read_header = read(&buf, &mut dst).unwrap();
        assert_eq!(read_header.target_id, "abc123");

        let got_a = dst.get(&id_a).unwrap();
        assert_eq!(got_a.bytes, b"precinct-bytes");
        assert!(got_a.is_complete);
        let got_b = dst.get(&id_b).unwrap();
        assert_eq!(got_b.bytes, b"header-bytes");
        assert!(!got_b.is_complete);
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut cache = MemoryCache::new();
        assert!(read(b"kjc/9.9\n", &mut cache).is_err());
    }
}
