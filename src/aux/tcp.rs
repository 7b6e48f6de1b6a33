//! TCP aux channel framing.
//!
//! The socket plumbing itself -- connect, read, write -- is out of scope
//! (it's the "low-level socket library" collaborator); this module only
//! turns one already-read chunk (preamble + payload) into an ack to send
//! back and a set of parsed JPIP messages, writing their data straight
//! into the cache as it goes. Attributing a chunk to the right request
//! and advancing later receivers' `overlap_bytes` needs the CID's active
//! receiver list, so that step lives in `cid`.

use super::vbas::{self, Message, VbasContext};
use super::Preamble;
use crate::databin::{BinClass, Cache, DataBinId};
use crate::error::{Error, Result};

pub struct ChunkResult {
    pub preamble: Preamble,
    pub ack: [u8; 8],
    pub messages: Vec<Message>,
    pub body_bytes: usize,
}

/// Processes one fully-buffered `[preamble][payload]` chunk.
pub fn receive_chunk(raw: &[u8], ctx: &mut VbasContext, cache: &mut dyn Cache) -> Result<ChunkResult> {
    if raw.len() < Preamble::SIZE {
        return Err(Error::MalformedResponse("aux chunk shorter than preamble".into()));
    }
    let mut pre_bytes = [0u8; 8];
    pre_bytes.copy_from_slice(&raw[..Preamble::SIZE]);
    let preamble = Preamble::parse(&pre_bytes);
    let payload = &raw[Preamble::SIZE..];

    let (messages, _consumed) = vbas::parse_all(payload, ctx)?;
    write_to_cache(&messages, cache);

    Ok(ChunkResult {
        preamble,
        ack: preamble.ack_bytes(),
        messages,
        body_bytes: payload.len(),
    })
}

pub(crate) fn write_to_cache(messages: &[Message], cache: &mut dyn Cache) {
    for m in messages {
        if let Message::Data(d) = m {
            let id = DataBinId::new(BinClass::from_wire(d.class), d.codestream, d.bin_id);
            cache.add_to_databin(id, d.range_offset, &d.payload, d.is_final);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::databin::MemoryCache;

    fn encode_vbas(mut v: u64) -> Vec<u8> {
        let mut bytes = vec![(v & 0x7f) as u8];
        v >>= 7;
        while v > 0 {
            bytes.push(((v & 0x7f) as u8) | 0x80);
            v >>= 7;
        }
        bytes.reverse();
        bytes
    }

    #[test]
    fn receive_chunk_acks_and_writes_cache() {
        // class_delta=3, is_final=1, extend=0, nibble=1: bin_id=1 with no
        // continuation byte.
        let b0 = (3u8 << 5) | 0x10 | 0x01;
        let mut payload = vec![b0];
        payload.extend(encode_vbas(0));
        payload.extend(encode_vbas(0));
        payload.extend(encode_vbas(0));
        payload.extend(encode_vbas(3));
        payload.extend_from_slice(b"abc");

        let preamble = Preamble { chunk_length: (8 + payload.len()) as u16, qid_low: 5, seq: 0 };
        let mut raw = preamble.to_bytes().to_vec();
        raw.extend(payload);

        let mut ctx = VbasContext::default();
        let mut cache = MemoryCache::new();
        let result = receive_chunk(&raw, &mut ctx, &mut cache).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.ack[0], 0);
        assert_eq!(result.ack[1], 0);
        assert_eq!(cache.iter().count(), 1);
    }
}
