//! UDP aux channel: chunk-gap bookkeeping for the unreliable transport,
//! plus the loss-simulation / rate-throttle testing hooks modeled on the
//! `-simulate_loss`/`-simulate_rate` options of reference JPIP clients.

use super::vbas::{self, Message, VbasContext};
use crate::request::ChunkGap;

/// Single-byte ack for one received datagram: the low byte of its
/// sequence number, echoed straight back.
pub fn ack_byte(seq: u64) -> u8 {
    (seq & 0xff) as u8
}

pub struct DatagramResult {
    pub ack: u8,
    pub messages: Vec<Message>,
}

pub fn receive_datagram(payload: &[u8], seq: u64, ctx: &mut VbasContext) -> crate::error::Result<DatagramResult> {
    let (messages, _) = vbas::parse_all(payload, ctx)?;
    Ok(DatagramResult { ack: ack_byte(seq), messages })
}

/// Removes `seq` from `gaps`, splitting or shrinking the interval that
/// contains it. `gaps` is kept sorted and non-overlapping throughout.
pub fn mark_received(gaps: &mut Vec<ChunkGap>, seq: u64) {
    let Some(i) = gaps.iter().position(|g| g.contains(seq)) else { return };
    let g = gaps[i];

    match (g.from == seq, g.to) {
        (true, Some(to)) if to == seq => {
            gaps.remove(i);
        }
        (true, _) => {
            gaps[i].from = seq + 1;
        }
        (false, Some(to)) if to == seq => {
            gaps[i].to = Some(seq - 1);
        }
        (false, Some(to)) => {
            gaps[i].to = Some(seq - 1);
            gaps.insert(i + 1, ChunkGap { from: seq + 1, to: Some(to) });
        }
        (false, None) => {
            gaps[i].to = Some(seq - 1);
            gaps.insert(i + 1, ChunkGap { from: seq + 1, to: None });
        }
    }
}

/// Once the terminating datagram's sequence number is known, an
/// open-ended gap no longer extends to infinity: cap it at `last_seq`.
pub fn close_open_ended(gaps: &mut [ChunkGap], last_seq: u64) {
    for g in gaps.iter_mut() {
        if g.to.is_none() {
            g.to = Some(last_seq);
        }
    }
}

/// Collapses a request's full gap list down to its spanning interval, for
/// the `abandon=` field once the list would otherwise exceed
/// `max_abandon_gaps`.
pub fn collapse_to_span(gaps: &[ChunkGap]) -> Option<ChunkGap> {
    let from = gaps.iter().map(|g| g.from).min()?;
    let to = gaps.iter().try_fold(0u64, |acc, g| Some(acc.max(g.to?)));
    Some(ChunkGap { from, to })
}

/// Accumulates synthetic receive delay for the `-simulate_rate` testing
/// hook: every chunk's bytes push the gate forward by
/// `chunk_len * min_usecs_per_byte`, bounding how fast aux chunks may be
/// considered to arrive.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvGate {
    pub accumulated_usecs: f64,
}

impl RecvGate {
    pub fn advance(&mut self, chunk_len: usize, min_usecs_per_byte: f64) -> f64 {
        self.accumulated_usecs += chunk_len as f64 * min_usecs_per_byte;
        self.accumulated_usecs
    }
}

/// Deterministic `-simulate_loss` hook: drops a fraction `probability` of
/// datagrams, selected by an externally supplied pseudo-random stream so
/// tests can replay exact loss patterns.
pub fn should_drop(probability: f32, draw: f32) -> bool {
    probability > 0.0 && draw < probability
}

#[cfg(test)]
mod test {
    use super::*;

    fn span(from: u64, to: Option<u64>) -> ChunkGap {
        ChunkGap { from, to }
    }

    #[test]
    fn mark_received_removes_singleton() {
        let mut gaps = vec![span(5, Some(5))];
        mark_received(&mut gaps, 5);
        assert!(gaps.is_empty());
    }

    #[test]
    fn mark_received_shrinks_left_boundary() {
        let mut gaps = vec![span(0, None)];
        mark_received(&mut gaps, 0);
        assert_eq!(gaps, vec![span(1, None)]);
    }

    #[test]
    fn mark_received_shrinks_right_boundary() {
        let mut gaps = vec![span(0, Some(10))];
        mark_received(&mut gaps, 10);
        assert_eq!(gaps, vec![span(0, Some(9))]);
    }

    #[test]
    fn mark_received_splits_interior_of_closed_range() {
        let mut gaps = vec![span(0, Some(10))];
        mark_received(&mut gaps, 5);
        assert_eq!(gaps, vec![span(0, Some(4)), span(6, Some(10))]);
    }

    #[test]
    fn mark_received_splits_open_ended_range() {
        let mut gaps = vec![span(0, None)];
        mark_received(&mut gaps, 5);
        assert_eq!(gaps, vec![span(0, Some(4)), span(6, None)]);
    }

    #[test]
    fn close_open_ended_caps_infinite_gap() {
        let mut gaps = vec![span(0, Some(4)), span(6, None)];
        close_open_ended(&mut gaps, 20);
        assert_eq!(gaps, vec![span(0, Some(4)), span(6, Some(20))]);
    }

    #[test]
    fn collapse_spans_all_gaps() {
        let gaps = vec![span(0, Some(4)), span(10, Some(20))];
        assert_eq!(collapse_to_span(&gaps), Some(span(0, Some(20))));
    }

    #[test]
    fn recv_gate_accumulates() {
        let mut gate = RecvGate::default();
        gate.advance(1000, 0.5);
        gate.advance(1000, 0.5);
        assert_eq!(gate.accumulated_usecs, 1000.0);
    }
}
