//! The JPIP message parser: VBAS (variable-length
//! byte-aligned sequence) message headers, plus the EOR sentinel.

use crate::error::{Error, Result};

/// Carries the "last seen message-class and codestream-id" context a CID
/// keeps between messages so that class-delta `1` ("reuse") can omit
/// both fields on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct VbasContext {
    pub last_class: u64,
    pub last_codestream: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(DataMessage),
    /// `B == 0x00` followed by a one-byte reason code.
    Eor(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    /// `class >> 1`, i.e. already shifted down from the wire encoding,
    /// ready to feed straight into the cache.F.
    pub class: u64,
    pub codestream: u64,
    pub bin_id: u64,
    pub range_offset: u64,
    pub range_length: u64,
    pub is_final: bool,
    pub payload: Vec<u8>,
}

/// Plain VBAS: 7 bits per byte, continuation while the MSB is set.
fn read_vbas(buf: &[u8], pos: &mut usize) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    loop {
        let Some(&b) = buf.get(*pos) else { return Ok(None) };
        *pos += 1;
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
        if *pos > 16 {
            return Err(Error::IllegalVbas("VBAS integer too long".into()));
        }
    }
}

/// Attempts to parse one message starting at the front of `buf`.
/// Returns `Ok(None)` when `buf` doesn't yet hold a complete message (the
/// caller should wait for more bytes and retry); otherwise the parsed
/// message plus the number of bytes it consumed.
pub fn parse_message(buf: &[u8], ctx: &mut VbasContext) -> Result<Option<(Message, usize)>> {
    let mut pos = 0usize;
    let Some(&b0) = buf.first() else { return Ok(None) };

    if b0 == 0 {
        let Some(&reason) = buf.get(1) else { return Ok(None) };
        return Ok(Some((Message::Eor(reason), 2)));
    }
    pos += 1;

    let extend = b0 & 0x80 != 0;
    let class_delta = (b0 >> 5) & 0x3;
    let is_final = b0 & 0x10 != 0;
    let mut bin_id = (b0 & 0x0f) as u64;

    if class_delta == 0 {
        return Err(Error::IllegalVbas("class-delta flag 0 is illegal".into()));
    }

    // Bin-id continuation bytes only follow when bit 7 of b0 is set; a
    // small bin-id is carried entirely in the first-byte nibble.
    if extend {
        loop {
            let Some(&b) = buf.get(pos) else { return Ok(None) };
            pos += 1;
            bin_id = (bin_id << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                break;
            }
        }
    }

    let (wire_class, codestream) = match class_delta {
        1 => (ctx.last_class, ctx.last_codestream),
        2 => {
            let Some(c) = read_vbas(buf, &mut pos)? else { return Ok(None) };
            (c, ctx.last_codestream)
        }
        3 => {
            let Some(c) = read_vbas(buf, &mut pos)? else { return Ok(None) };
            let Some(cs) = read_vbas(buf, &mut pos)? else { return Ok(None) };
            (c, cs)
        }
        _ => unreachable!(),
    };

    if wire_class % 2 == 1 {
        // Odd class-id carries an extra aux VBAS we must consume to stay
        // in sync, even though its contents are out of scope here.
        if read_vbas(buf, &mut pos)?.is_none() {
            return Ok(None);
        }
    }

    let Some(range_offset) = read_vbas(buf, &mut pos)? else { return Ok(None) };
    let Some(range_length) = read_vbas(buf, &mut pos)? else { return Ok(None) };

    if buf.len() < pos + range_length as usize {
        return Ok(None);
    }
    let payload = buf[pos..pos + range_length as usize].to_vec();
    pos += range_length as usize;

    ctx.last_class = wire_class;
    ctx.last_codestream = codestream;

    Ok(Some((
        Message::Data(DataMessage {
            class: wire_class >> 1,
            codestream,
            bin_id,
            range_offset,
            range_length,
            is_final,
            payload,
        }),
        pos,
    )))
}

/// Parses every complete message at the front of `buf`, returning the
/// messages plus total bytes consumed; leaves a trailing partial message
/// (if any) unconsumed for the next call.
pub fn parse_all(buf: &[u8], ctx: &mut VbasContext) -> Result<(Vec<Message>, usize)> {
    let mut messages = Vec::new();
    let mut offset = 0;
    loop {
        match parse_message(&buf[offset..], ctx)? {
            Some((msg, consumed)) => {
                offset += consumed;
                let is_eor = matches!(msg, Message::Eor(_));
                messages.push(msg);
                if is_eor {
                    break;
                }
            }
            None => break,
        }
    }
    Ok((messages, offset))
}
