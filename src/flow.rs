//! The flow regulator.
//!
//! Purely advisory: nothing here ever fails. All times are expressed as
//! signed microsecond counts (an `i64`, matching the "nominal/target times
//! may be negative briefly during resync" character of the rest of the
//! scheduler) and all byte counts as `u64`.

use crate::config::JpipConfig;

/// One chunk's arrival, as reported by the aux/primary receive path.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEvent {
    pub chunk_len: u64,
    pub request_issue_time: i64,
    pub chunk_received_time: i64,
    pub group_stamp: u64,
    pub cum_group_byte_limit: u64,
    pub overlap_bytes: u64,
    /// Caller's guess that this is the final chunk of the group.
    pub last_grp_chunk: bool,
    pub have_more_requests: bool,
    /// True when requests in this group are disjoint (stateless mode);
    /// selects `eta = 0` rather than `0.5` in the rate-correction step.
    pub stateless: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupState {
    stamp: u64,
    issue_time: i64,
    first_bytes: u64,
    first_usecs: i64,
    total_bytes: u64,
    total_usecs: i64,
    max_chunk: u64,
    overlap_bytes: u64,
    max_bytes: u64,
    stateless: bool,
}

const ALPHA: f64 = 1.0 / 8.0;

#[derive(Debug)]
pub struct FlowRegulator {
    pub lmax: u64,
    min_request_byte_limit: u64,
    lmax_min_bytes: u64,
    lmax_min_usecs: u64,
    lmax_max_usecs: u64,

    cum_bytes: u64,
    cum_usecs: i64,
    fast_bytes: u64,
    fast_usecs: i64,

    current: Option<GroupState>,
    /// `I_g` of the *previous* completed group; negative when that group
    /// was paused on arrival of its first chunk.
    inter_grp_usecs: i64,

    last_issued_unlimited: bool,
    accumulating_group: bool,
}

impl FlowRegulator {
    pub fn new(config: &JpipConfig) -> FlowRegulator {
        FlowRegulator {
            lmax: config.lmax_min_bytes,
            min_request_byte_limit: 0,
            lmax_min_bytes: config.lmax_min_bytes,
            lmax_min_usecs: config.lmax_min_usecs,
            lmax_max_usecs: config.lmax_max_usecs,
            cum_bytes: 0,
            cum_usecs: 0,
            fast_bytes: 0,
            fast_usecs: 0,
            current: None,
            inter_grp_usecs: 0,
            last_issued_unlimited: false,
            accumulating_group: false,
        }
    }

    /// Server may advertise a minimum request byte limit it will honour;
    /// `Lmax` is never allowed to fall below it.
    pub fn set_min_request_byte_limit(&mut self, n: u64) {
        self.min_request_byte_limit = n;
    }

    pub fn note_request_issued(&mut self, unlimited: bool) {
        self.last_issued_unlimited = unlimited;
        self.accumulating_group = !unlimited;
    }

    /// Gate for issuing a new byte-limited request on this CID.
    pub fn can_issue_regular_request(&self, outstanding_bytes: u64, stateless: bool) -> bool {
        (stateless && outstanding_bytes == 0)
            || self.last_issued_unlimited
            || self.accumulating_group
            || outstanding_bytes <= self.lmax / 2
    }

    pub fn bounded_rate(&self) -> f64 {
        let cap = 1e9 / self.lmax_max_usecs as f64;
        if self.cum_usecs > 0 {
            (self.cum_bytes as f64 / self.cum_usecs as f64).min(cap)
        } else {
            cap
        }
    }

    pub fn on_chunk(&mut self, ev: ChunkEvent) {
        let delay = ev.chunk_received_time - ev.request_issue_time;
        let g = self.current.get_or_insert_with(|| GroupState {
            stamp: ev.group_stamp,
            issue_time: ev.request_issue_time,
            first_bytes: ev.chunk_len,
            first_usecs: delay,
            max_bytes: ev.cum_group_byte_limit,
            overlap_bytes: ev.overlap_bytes,
            stateless: ev.stateless,
            ..Default::default()
        });
        if g.stamp != ev.group_stamp {
            self.finalize_group();
            self.current = Some(GroupState {
                stamp: ev.group_stamp,
                issue_time: ev.request_issue_time,
                first_bytes: ev.chunk_len,
                first_usecs: delay,
                max_bytes: ev.cum_group_byte_limit,
                overlap_bytes: ev.overlap_bytes,
                stateless: ev.stateless,
                ..Default::default()
            });
        }
        let g = self.current.as_mut().unwrap();
        g.total_bytes += ev.chunk_len;
        g.total_usecs = delay;
        g.max_chunk = g.max_chunk.max(ev.chunk_len);
        g.max_bytes = ev.cum_group_byte_limit.max(g.max_bytes);

        if ev.last_grp_chunk && !ev.have_more_requests {
            self.finalize_group();
        } else if ev.last_grp_chunk {
            self.finalize_group();
        }
    }

    fn finalize_group(&mut self) {
        let g = match self.current.take() {
            Some(g) => g,
            None => return,
        };
        let eta = if g.stateless { 0.0 } else { 0.5 };
        let c_g = g.max_chunk as f64;

        // Step 1: Lmax >= 3*C_g
        self.lmax = self.lmax.max(3 * g.max_chunk);

        // Step 2: rate estimate + Lmax correction.
        let l_b = g.total_bytes.saturating_sub(g.first_bytes) as f64;
        let t_b = (g.total_usecs - g.first_usecs) as f64;
        if l_b > 0.0 && t_b > 0.0 {
            let r_b = l_b / t_b;
            let t0 = g.first_usecs as f64;
            let l0 = g.first_bytes as f64;
            let v_g = g.overlap_bytes as f64;
            let lmax_f = self.lmax as f64;

            let t_g = t0 - (v_g + l0) / r_b;
            let t_gmin = t0 - ((eta * (lmax_f - c_g)).max(v_g) + l0) / r_b;
            let target_gap = ALPHA * lmax_f / r_b;

            let lmax_new = ((t0 * r_b - l0 + eta * c_g) / (eta + ALPHA)).max(0.0);
            let mut delta = lmax_new - lmax_f;

            if t_gmin > target_gap {
                // Lmax too small: grow.
                if delta > 0.0 {
                    let scale = (l_b / (lmax_f + delta)).min(1.0);
                    delta *= scale;
                    let capped_new = (lmax_f + delta).min(2.0 * lmax_f);
                    self.lmax = capped_new.max(lmax_f) as u64;
                }
            } else if t_g < target_gap {
                // Lmax too large: shrink.
                if delta < 0.0 {
                    let scale = (l_b / lmax_f).min(1.0);
                    delta *= scale;
                    let floor = 0.75 * lmax_f;
                    self.lmax = (lmax_f + delta).max(floor) as u64;
                }
            }
        }

        // Step 3: correct the stored inter-group gap using this group's
        // rate, if the previous group was paused waiting for its first
        // chunk and the overlap carried forward was thin.
        if self.inter_grp_usecs >= 0 && l_b > 0.0 && t_b > 0.0 {
            let r_b = l_b / t_b;
            let v_min = eta * self.lmax as f64 - c_g;
            let v_g = g.overlap_bytes as f64;
            if v_g < v_min {
                let l0 = g.first_bytes as f64;
                let lo = (self.inter_grp_usecs as f64
                    - (v_min - v_g).max(0.0) / r_b)
                    .max((l0 + ALPHA * self.lmax as f64) / r_b);
                self.inter_grp_usecs = lo as i64;
            }
        }
        self.inter_grp_usecs = g.total_usecs - g.first_usecs;

        // Step 4: attenuate / drop this group's contribution.
        let rho = if g.max_bytes > 0 {
            (g.total_bytes as f64 / g.max_bytes as f64).min(1.0)
        } else {
            1.0
        };
        if rho >= 0.25 {
            self.cum_bytes += (rho * g.total_bytes as f64) as u64;
            self.cum_usecs += (rho * g.total_usecs as f64) as i64;
            let fast_bytes = g.total_bytes.saturating_sub(g.first_bytes);
            let fast_usecs = g.total_usecs - g.first_usecs;
            self.fast_bytes += (rho * fast_bytes as f64) as u64;
            self.fast_usecs += (rho * fast_usecs as f64) as i64;
        }

        // Step 5: renormalise accumulators.
        if self.cum_bytes > 2 * self.lmax && self.cum_bytes > 0 {
            let factor = (2 * self.lmax) as f64 / self.cum_bytes as f64;
            self.cum_bytes = (self.cum_bytes as f64 * factor) as u64;
            self.cum_usecs = (self.cum_usecs as f64 * factor) as i64;
        }
        if self.fast_usecs > self.lmax_min_usecs as i64 && self.fast_usecs > 0 {
            let factor = self.lmax_min_usecs as f64 / self.fast_usecs as f64;
            self.fast_bytes = (self.fast_bytes as f64 * factor) as u64;
            self.fast_usecs = (self.fast_usecs as f64 * factor) as i64;
        }

        // Step 6: bound Lmax.
        let rate = self.bounded_rate();
        let lower = (rate * self.lmax_min_usecs as f64)
            .max(self.min_request_byte_limit as f64)
            .max(self.lmax_min_bytes as f64)
            .max(3.0 * g.max_chunk as f64);
        let upper = (rate * self.lmax_max_usecs as f64).max(lower);
        self.lmax = (self.lmax as f64).clamp(lower, upper) as u64;

        self.accumulating_group = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn regulator() -> FlowRegulator {
        FlowRegulator::new(&JpipConfig::default())
    }

    #[test]
    fn lmax_respects_floor() {
        let fr = regulator();
        assert_eq!(fr.lmax, 2048);
    }

    #[test]
    fn single_group_keeps_lmax_within_bounds() {
        let mut fr = regulator();
        fr.on_chunk(ChunkEvent {
            chunk_len: 4000,
            request_issue_time: 0,
            chunk_received_time: 100_000,
            group_stamp: 1,
            cum_group_byte_limit: 4000,
            overlap_bytes: 0,
            last_grp_chunk: true,
            have_more_requests: true,
            stateless: true,
        });
        let rate = fr.bounded_rate();
        assert!(fr.lmax >= 3 * 4000);
        assert!(fr.lmax as f64 <= rate * fr.lmax_max_usecs as f64 + 1.0);
        assert!(fr.lmax as f64 >= (rate * fr.lmax_min_usecs as f64).min(fr.lmax as f64));
    }

    #[test]
    fn gating_allows_stateless_first_request() {
        let fr = regulator();
        assert!(fr.can_issue_regular_request(0, true));
        assert!(!fr.can_issue_regular_request(1_000_000, false));
    }

    #[test]
    fn gating_allows_fifty_percent_overlap() {
        let mut fr = regulator();
        fr.lmax = 10_000;
        assert!(fr.can_issue_regular_request(5_000, false));
        assert!(!fr.can_issue_regular_request(5_001, false));
    }
}
