//! The CID (JPIP channel) scheduler -- the core decision
//! loop multiplexing every queue attached to one server-assigned channel.

use crate::config::JpipConfig;
use crate::flow::FlowRegulator;
use crate::queue::{QueueId, RequestQueue};
use crate::request::{ChunkGap, DependencyRef, EorReason, RequestArena, RequestHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidId(u32);

impl CidId {
    pub fn new(n: u32) -> CidId {
        CidId(n)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    HttpOnly,
    HttpTcp,
    HttpUdp,
}

/// One queue's contribution to a scheduling pass: the counts the
/// round-robin candidate rule needs to decide which queue goes next.
#[derive(Debug, Clone, Copy)]
struct QueueCounts {
    has_unrequested: bool,
    waiting_for_reply: bool,
    waiting_for_startup_reply: bool,
    timed_mode: bool,
    regular_empty: bool,
    next_nominal_start_time: i64,
}

fn queue_counts(q: &RequestQueue, arena: &RequestArena) -> QueueCounts {
    let waiting_for_startup_reply = q.just_started
        && q.iter().next().map(|h| arena.get(h).map(|r| !r.eor.reply_received).unwrap_or(false)).unwrap_or(false);
    let waiting_for_reply = q
        .iter()
        .any(|h| arena.get(h).map(|r| !r.eor.reply_received).unwrap_or(false));
    QueueCounts {
        has_unrequested: q.has_unrequested(),
        waiting_for_reply,
        waiting_for_startup_reply,
        timed_mode: q.timed_mode,
        regular_empty: q.is_empty(),
        next_nominal_start_time: q.next_nominal_start_time,
    }
}

/// A server-assigned JPIP channel multiplexing one or more queues.
#[derive(Debug)]
pub struct Cid {
    pub id: CidId,
    pub transport: Transport,
    /// The server-assigned channel identifier from a `JPIP-cnew` reply
    /// (the `cid=` value itself); `None` until that handshake completes,
    /// in which case requests on this channel still carry `target=`.
    pub server_id: Option<String>,
    pub queues: Vec<QueueId>,
    pub rtt_usecs: i64,
    pub last_target_end_time: i64,
    last_requester_index: usize,
    pub waiting_to_sync_nominal_request_timing: bool,
    /// Active receivers on the aux channel, ordered by issue time: the
    /// first element is "the first active receiver whose response is not
    /// terminated" for overlap-byte attribution.
    pub active_receivers: Vec<RequestHandle>,
    pub flow: FlowRegulator,
    previous_was_byte_limited: bool,
    previous_was_unlimited: bool,
}

impl Cid {
    pub fn new(id: CidId, transport: Transport, config: &JpipConfig) -> Cid {
        Cid {
            id,
            transport,
            server_id: None,
            queues: Vec::new(),
            rtt_usecs: 0,
            last_target_end_time: -1,
            last_requester_index: 0,
            waiting_to_sync_nominal_request_timing: false,
            active_receivers: Vec::new(),
            flow: FlowRegulator::new(config),
            previous_was_byte_limited: false,
            previous_was_unlimited: true,
        }
    }

    pub fn attach_queue(&mut self, queue_id: QueueId) {
        if !self.queues.contains(&queue_id) {
            self.queues.push(queue_id);
        }
    }

    pub fn detach_queue(&mut self, queue_id: QueueId) {
        self.queues.retain(|&q| q != queue_id);
    }

    pub fn num_incomplete_requests(&self, queues: &[&RequestQueue], arena: &RequestArena) -> u64 {
        queues
            .iter()
            .flat_map(|q| q.iter())
            .filter(|&h| arena.get(h).map(|r| !r.is_retirable()).unwrap_or(false))
            .count() as u64
    }

    /// Rule 1: admission gating.
    fn admission_ok(&self, outstanding_bytes: u64, stateless: bool, has_close_when_idle: bool) -> bool {
        if self.previous_was_byte_limited {
            self.flow.can_issue_regular_request(outstanding_bytes, stateless) || has_close_when_idle
        } else {
            true
        }
    }

    /// The minimum inter-request interval implied by rule 1's "previous
    /// unlimited, multiple requests outstanding" throttle.
    pub fn min_interval_usecs(&self, config: &JpipConfig, w_outstanding: u64) -> i64 {
        if !self.previous_was_unlimited || w_outstanding <= 1 {
            return 0;
        }
        let w = w_outstanding as f64;
        let numerator = (config.abandon_factor as f64 + 1.0) * w * self.rtt_usecs as f64;
        (numerator / (config.window_target as f64).powi(2)) as i64
    }

    /// Rule 2: round-robin candidate selection from the queue after the
    /// last requester.
    fn select_candidate(&self, queues: &[(&RequestQueue, QueueCounts)]) -> Option<usize> {
        let n = queues.len();
        if n == 0 {
            return None;
        }
        let mut best: Option<(usize, i64, bool)> = None;
        for step in 0..n {
            let idx = (self.last_requester_index + 1 + step) % n;
            let (q, counts) = queues[idx];
            let candidate = counts.has_unrequested
                && (q.just_started && q.len() == 1 || !q.just_started);
            if !candidate {
                continue;
            }
            let just_started = q.just_started;
            let key = (counts.next_nominal_start_time, !just_started);
            match &best {
                None => best = Some((idx, key.0, key.1)),
                Some((_, t, started_worse)) => {
                    // Prefer smaller next_nominal_start_time; among ties,
                    // prefer just-started queues (started_worse == false).
                    if key.0 < *t || (key.0 == *t && !key.1 && *started_worse) {
                        best = Some((idx, key.0, key.1));
                    }
                }
            }
        }
        best.map(|(idx, _, _)| idx)
    }

    /// Rule 3: preemption filter. `unreplied_on_other_queue` reports
    /// whether issuing `candidate` would preempt an as-yet-unreplied
    /// request belonging to a different queue on this CID.
    fn preemption_allowed(
        &self,
        candidate_preemptive: bool,
        unreplied_elsewhere_is_startup: bool,
        unreplied_elsewhere: bool,
    ) -> bool {
        !candidate_preemptive || !unreplied_elsewhere || unreplied_elsewhere_is_startup
    }

    /// Rule 4: lag compensation. Returns the per-queue `t_q` adjustment
    /// for every idle queue (positive) and the deficit distributed across
    /// queues with requests to send (negative), preserving `N*tC = Σ t_q`.
    pub fn lag_compensation(&self, now_tc: i64, queues: &mut [&mut RequestQueue], timed_mode_flags: &[bool]) {
        let mut total_lag = 0i64;
        let mut idle_indices = Vec::new();
        let mut sending_indices = Vec::new();
        for (i, q) in queues.iter().enumerate() {
            if q.has_unrequested() {
                sending_indices.push(i);
            } else {
                let rtt_term = if timed_mode_flags[i] { self.rtt_usecs } else { 0 };
                let lag = (now_tc - q.next_nominal_start_time - rtt_term).max(0);
                total_lag += lag;
                idle_indices.push(i);
            }
        }
        if sending_indices.is_empty() || total_lag == 0 {
            return;
        }
        let k = sending_indices.len() as i64;
        let share = total_lag / k;
        for &i in &sending_indices {
            queues[i].next_nominal_start_time -= share;
        }
        for &i in &idle_indices {
            let rtt_term = if timed_mode_flags[i] { self.rtt_usecs } else { 0 };
            let lag = (now_tc - queues[i].next_nominal_start_time - rtt_term).max(0);
            queues[i].next_nominal_start_time += lag;
        }
    }

    /// `find_next_requester`: the full decision, folding rules 1-3 (rule 4
    /// is applied separately by the manager loop once per scheduling pass,
    /// since it touches every idle queue regardless of which one is
    /// chosen here).
    pub fn find_next_requester(
        &mut self,
        now: i64,
        queues: &[&RequestQueue],
        arena: &RequestArena,
        outstanding_bytes: u64,
        stateless: bool,
    ) -> Option<usize> {
        let _ = now;
        let has_close_when_idle = queues.iter().any(|q| q.close_when_idle);
        if !self.admission_ok(outstanding_bytes, stateless, has_close_when_idle) {
            return queues.iter().position(|q| q.close_when_idle && q.has_unrequested());
        }

        let counted: Vec<(&RequestQueue, QueueCounts)> =
            queues.iter().map(|&q| (q, queue_counts(q, arena))).collect();
        let chosen = self.select_candidate(&counted)?;

        let candidate_req = queues[chosen].unrequested().first().copied()?;
        let candidate_preemptive = arena.get(candidate_req).map(|r| r.preemptive).unwrap_or(false);

        let mut unreplied_elsewhere = false;
        let mut unreplied_elsewhere_is_startup = true;
        for (i, q) in queues.iter().enumerate() {
            if i == chosen {
                continue;
            }
            if let Some(h) = q.window_info(arena, Default::default()).or_else(|| q.iter().last()) {
                if let Some(req) = arena.get(h) {
                    if !req.eor.reply_received {
                        unreplied_elsewhere = true;
                        unreplied_elsewhere_is_startup = q.just_started && q.len() == 1;
                    }
                }
            }
        }

        if !self.preemption_allowed(candidate_preemptive, unreplied_elsewhere_is_startup, unreplied_elsewhere) {
            return None;
        }

        self.last_requester_index = chosen;
        Some(chosen)
    }

    pub fn note_request_sent(&mut self, byte_limited: bool) {
        self.previous_was_byte_limited = byte_limited;
        self.previous_was_unlimited = !byte_limited;
    }

    /// Timed-request duration assignment.
    pub fn target_duration(
        &self,
        posted_service_time: i64,
        total_queues: usize,
        regular_empty_queues: usize,
        smallest_last_noted_duration: i64,
    ) -> i64 {
        let n_prime = (total_queues.saturating_sub(regular_empty_queues)).max(1) as i64;
        if posted_service_time > 0 {
            posted_service_time / n_prime
        } else {
            smallest_last_noted_duration / n_prime
        }
    }

    /// `find_gaps_to_abandon`: scans active receivers for staleness,
    /// retiring each stale request (untrusted, response-terminated,
    /// communication-complete-forced) and returning its gaps for the next
    /// `abandon=` field.
    pub fn find_gaps_to_abandon(
        &mut self,
        now: i64,
        abandon_all: bool,
        arena: &mut RequestArena,
        config: &JpipConfig,
    ) -> Vec<(u64, Vec<ChunkGap>)> {
        let mut out = Vec::new();
        let mut retired = Vec::new();

        for &h in &self.active_receivers {
            let Some(req) = arena.get(h) else { continue };
            if req.chunk_gaps.is_empty() {
                continue;
            }
            let factor = if req.timing.received_body_bytes == 0 {
                2 * config.abandon_factor as i64
            } else {
                config.abandon_factor as i64
            };
            let stale = abandon_all || now - req.timing.last_event_time > factor * self.rtt_usecs;
            if !stale {
                continue;
            }
            if let Some(qid) = req.qid {
                out.push((qid, req.chunk_gaps.clone()));
            }
            retired.push(h);
        }

        for h in &retired {
            if let Some(req) = arena.get_mut(*h) {
                req.mark_untrusted();
                req.set_response_terminated(EorReason::Nonspecific, now);
                req.chunk_gaps.clear();
            }
        }
        self.active_receivers.retain(|h| !retired.contains(h));

        collapse_abandon_list(&mut out, config.max_abandon_gaps);
        out
    }

    /// Timing sync on the first data chunk of a timed request: shifts
    /// every stored nominal/target time by the observed skew so the
    /// fundamental equation keeps holding once real timing data is
    /// available.
    pub fn sync_timing(&mut self, actual_start_time: i64, nominal_start_time: i64, queues: &mut [&mut RequestQueue]) {
        if !self.waiting_to_sync_nominal_request_timing {
            return;
        }
        let skew = actual_start_time - nominal_start_time;
        if self.last_target_end_time >= 0 {
            self.last_target_end_time += skew;
        }
        for q in queues.iter_mut() {
            q.next_nominal_start_time += skew;
        }
        self.waiting_to_sync_nominal_request_timing = false;
    }

    /// Appends `req` to the active-receiver list, and returns the
    /// `overlap_bytes` value it should start with: the bytes already
    /// in flight for whichever earlier, still-unterminated receiver it
    /// follows.
    pub fn register_active_receiver(&mut self, req: RequestHandle, arena: &RequestArena) -> u64 {
        let overlap = self
            .active_receivers
            .iter()
            .rev()
            .find_map(|&h| arena.get(h).filter(|r| !r.eor.response_terminated).map(|r| r.timing.received_body_bytes))
            .unwrap_or(0);
        self.active_receivers.push(req);
        overlap
    }

    /// Dependency bookkeeping for a request crossing a CID boundary: the
    /// dependent carries a reference to the predecessor so its EOR can't
    /// be trusted until the predecessor also completes.
    pub fn link_dependency(dependent_qid: u64, queue_id: QueueId) -> DependencyRef {
        DependencyRef { queue_id, qid: dependent_qid }
    }
}

fn collapse_abandon_list(list: &mut Vec<(u64, Vec<ChunkGap>)>, max_total: usize) {
    loop {
        let total: usize = list.iter().map(|(_, gaps)| gaps.len()).sum();
        if total <= max_total {
            return;
        }
        let Some((_, gaps)) = list.iter_mut().find(|(_, gaps)| gaps.len() > 1) else { return };
        if let Some(span) = crate::aux::udp::collapse_to_span(gaps) {
            *gaps = vec![span];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::woi::WindowOfInterest;

    fn config() -> JpipConfig {
        JpipConfig::default()
    }

    #[test]
    fn select_candidate_prefers_just_started_queue() {
        let mut arena = RequestArena::new();
        let mut q1 = RequestQueue::new(QueueId::new(0));
        q1.post_window(&mut arena, WindowOfInterest::full_image(1, 1), false, None, 0, true);
        let mut q2 = RequestQueue::new(QueueId::new(1));
        q2.just_started = false;
        q2.post_window(&mut arena, WindowOfInterest::full_image(1, 1), false, None, 0, true);

        let cid = Cid::new(CidId::new(0), Transport::HttpOnly, &config());
        let refs: Vec<&RequestQueue> = vec![&q2, &q1];
        let counted: Vec<_> = refs.iter().map(|&q| (q, queue_counts(q, &arena))).collect();
        let chosen = cid.select_candidate(&counted).unwrap();
        assert_eq!(chosen, 1); // q1, the just-started one
    }

    #[test]
    fn abandon_list_collapses_to_spanning_gaps() {
        let mut list = vec![
            (1u64, vec![ChunkGap { from: 0, to: Some(0) }, ChunkGap { from: 2, to: Some(2) }]),
            (2u64, vec![ChunkGap { from: 10, to: Some(10) }, ChunkGap { from: 20, to: Some(20) }]),
        ];
        collapse_abandon_list(&mut list, 2);
        let total: usize = list.iter().map(|(_, g)| g.len()).sum();
        assert!(total <= 2);
    }

    #[test]
    fn min_interval_is_zero_after_byte_limited_request() {
        let mut cid = Cid::new(CidId::new(0), Transport::HttpOnly, &config());
        cid.note_request_sent(true);
        assert_eq!(cid.min_interval_usecs(&config(), 5), 0);
    }

    #[test]
    fn min_interval_throttles_after_unlimited_burst() {
        let mut cid = Cid::new(CidId::new(0), Transport::HttpOnly, &config());
        cid.rtt_usecs = 100_000;
        cid.note_request_sent(false);
        assert!(cid.min_interval_usecs(&config(), 4) > 0);
    }
}
