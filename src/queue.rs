//! The request queue.

use crate::request::{Request, RequestArena, RequestHandle};
use crate::woi::WindowOfInterest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

impl QueueId {
    pub fn new(n: u32) -> QueueId {
        QueueId(n)
    }
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Optional filter passed to `get_window_info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFilter {
    pub require_reply_received: bool,
    pub require_complete: bool,
}

/// Ordered list of requests submitted by one logical submitter. The list
/// itself lives as a `Vec<RequestHandle>` in posting order; the four
/// position pointers are plain indices into it, so the
/// `head <= first_incomplete <= first_unreplied <= first_unrequested <=
/// tail` invariant is just normal integer ordering.
#[derive(Debug)]
pub struct RequestQueue {
    pub id: QueueId,
    requests: Vec<RequestHandle>,
    /// Index of the oldest not-yet-fully-complete request.
    first_incomplete: usize,
    /// Index of the oldest request that hasn't received a reply.
    first_unreplied: usize,
    /// Index of the oldest request not yet issued to the wire.
    first_unrequested: usize,

    pub close_when_idle: bool,
    pub disconnect_timeout_usecs: i64,
    pub disconnect_deadline: Option<i64>,
    pub unreliable_transport: bool,
    pub just_started: bool,
    pub is_oob: bool,

    pub next_posted_start_time: i64,
    pub next_nominal_start_time: i64,
    pub last_noted_target_duration: i64,
    pub timed_mode: bool,
    /// Internal/external clock scale for posted-service-time bookkeeping:
    /// `next_posted_start_time` advances by the internally-scaled service
    /// time on each post.
    pub clock_scale: f64,
}

impl RequestQueue {
    pub fn new(id: QueueId) -> RequestQueue {
        RequestQueue {
            id,
            requests: Vec::new(),
            first_incomplete: 0,
            first_unreplied: 0,
            first_unrequested: 0,
            close_when_idle: false,
            disconnect_timeout_usecs: 0,
            disconnect_deadline: None,
            unreliable_transport: false,
            just_started: true,
            is_oob: false,
            next_posted_start_time: 0,
            next_nominal_start_time: 0,
            last_noted_target_duration: 0,
            timed_mode: false,
            clock_scale: 1.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestHandle> + '_ {
        self.requests.iter().copied()
    }

    pub fn unrequested(&self) -> &[RequestHandle] {
        &self.requests[self.first_unrequested..]
    }

    pub fn has_unrequested(&self) -> bool {
        self.first_unrequested < self.requests.len()
    }

    /// Checks invariant 1; used by the test harness.
    pub fn pointers_well_formed(&self) -> bool {
        self.first_incomplete <= self.first_unreplied
            && self.first_unreplied <= self.first_unrequested
            && self.first_unrequested <= self.requests.len()
    }

    fn append(&mut self, handle: RequestHandle) {
        self.requests.push(handle);
    }

    /// `post_window`. `is_only_queue` tells us whether the
    /// freshly-added startup request exemption applies when `preemptive`
    /// is set. Returns the handle of the (possibly pre-existing) request.
    #[allow(clippy::too_many_arguments)]
    pub fn post_window(
        &mut self,
        arena: &mut RequestArena,
        woi: WindowOfInterest,
        preemptive: bool,
        custom_id: Option<String>,
        service_usecs: i64,
        is_only_queue: bool,
    ) -> RequestHandle {
        if let Some(id) = &custom_id {
            if let Some(existing) = self.find_subsuming(arena, id, &woi) {
                return existing;
            }
        }

        if preemptive {
            self.remove_unrequested(arena, is_only_queue);
        }

        let mut request = Request::new(self.id, woi, preemptive);
        request.custom_id = custom_id;

        if service_usecs > 0 {
            self.timed_mode = true;
            request.timing.nominal_start_time = self.next_posted_start_time;
            request.timing.posted_service_time = service_usecs;
            self.next_posted_start_time += (service_usecs as f64 * self.clock_scale) as i64;
            self.last_noted_target_duration = service_usecs;
        } else {
            self.timed_mode = false;
        }

        let handle = arena.insert(request);
        self.append(handle);
        handle
    }

    /// Appends a preemption-duplicate or continuation copy straight to
    /// the tail, bypassing `post_window`'s subsumption/preemption checks
    /// since the copy is already a fully-formed `Request`.
    pub fn enqueue_copy(&mut self, handle: RequestHandle) {
        self.append(handle);
    }

    /// Out-of-band queue variant: identical bookkeeping, just marks the
    /// queue (which must be the singleton OOB queue) as such.
    #[allow(clippy::too_many_arguments)]
    pub fn post_oob_window(
        &mut self,
        arena: &mut RequestArena,
        woi: WindowOfInterest,
        preemptive: bool,
        custom_id: Option<String>,
        service_usecs: i64,
    ) -> RequestHandle {
        self.is_oob = true;
        self.post_window(arena, woi, preemptive, custom_id, service_usecs, true)
    }

    fn find_subsuming(
        &self,
        arena: &RequestArena,
        custom_id: &str,
        woi: &WindowOfInterest,
    ) -> Option<RequestHandle> {
        for &h in self.requests.iter().rev() {
            let req = arena.get(h)?;
            if req.state == crate::request::RequestState::Complete {
                continue;
            }
            if req.custom_id.as_deref() == Some(custom_id) && req.woi.contains(woi) {
                return Some(h);
            }
        }
        None
    }

    /// Removes all unrequested requests, excluding the startup request of
    /// a freshly-added queue unless it is the only queue.
    fn remove_unrequested(&mut self, arena: &mut RequestArena, is_only_queue: bool) {
        let keep_startup = self.just_started && !is_only_queue;
        let start = if keep_startup {
            (self.first_unrequested + 1).min(self.requests.len())
        } else {
            self.first_unrequested
        };
        for &h in &self.requests[start..] {
            arena.remove(h);
        }
        self.requests.truncate(start);
    }

    /// `trim_timed_requests`: removes all unrequested
    /// requests and returns the (external-scale) service time recovered.
    pub fn trim_timed_requests(&mut self, arena: &mut RequestArena) -> i64 {
        let mut recovered = 0i64;
        for &h in &self.requests[self.first_unrequested..] {
            if let Some(req) = arena.get(h) {
                recovered += req.timing.posted_service_time;
            }
            arena.remove(h);
        }
        self.requests.truncate(self.first_unrequested);
        if recovered > 0 {
            self.next_posted_start_time -= (recovered as f64 * self.clock_scale) as i64;
        }
        recovered
    }

    /// `get_window_in_progress`: the most recent request whose reply has
    /// been received.
    pub fn window_in_progress(&self, arena: &RequestArena) -> Option<RequestHandle> {
        self.requests.iter().rev().copied().find(|&h| {
            arena.get(h).map(|r| r.eor.reply_received).unwrap_or(false)
        })
    }

    /// `get_window_info(status_flags)`.
    pub fn window_info(&self, arena: &RequestArena, filter: StatusFilter) -> Option<RequestHandle> {
        self.requests.iter().rev().copied().find(|&h| {
            let req = match arena.get(h) {
                Some(r) => r,
                None => return false,
            };
            (!filter.require_reply_received || req.eor.reply_received)
                && (!filter.require_complete || req.state == crate::request::RequestState::Complete)
        })
    }

    /// Advances `first_unrequested` after issuing `handle` to the wire;
    /// called by the CID scheduler once it hands the request to a primary
    /// channel.
    pub fn note_issued(&mut self, handle: RequestHandle) {
        if let Some(pos) = self.position_of(handle) {
            if pos == self.first_unrequested {
                self.first_unrequested += 1;
            }
        }
        self.just_started = false;
    }

    pub fn note_replied(&mut self, handle: RequestHandle) {
        if let Some(pos) = self.position_of(handle) {
            if pos == self.first_unreplied {
                self.first_unreplied += 1;
            }
        }
    }

    /// Invariant 2/3: retire `handle` only when fully
    /// complete or superseded; never remove the most-recently-replied
    /// request.
    pub fn retire(&mut self, arena: &mut RequestArena, handle: RequestHandle) -> bool {
        let last_replied = self.window_in_progress(arena);
        if last_replied == Some(handle) {
            return false;
        }
        let Some(pos) = self.position_of(handle) else { return false };
        let is_retirable = arena.get(handle).map(|r| r.is_retirable()).unwrap_or(false);
        if !is_retirable {
            return false;
        }
        if let Some(req) = arena.get_mut(handle) {
            req.mark_complete();
        }
        if pos == self.first_incomplete {
            arena.remove(handle);
            self.requests.remove(pos);
            if self.first_incomplete > pos {
                self.first_incomplete -= 1;
            }
            if self.first_unreplied > pos {
                self.first_unreplied -= 1;
            }
            if self.first_unrequested > pos {
                self.first_unrequested -= 1;
            }
            self.first_incomplete = self.first_incomplete.min(self.requests.len());
            true
        } else {
            // Not yet at the head of the incomplete run; leave it queued
            // (still marked Complete) until its predecessors retire too.
            true
        }
    }

    fn position_of(&self, handle: RequestHandle) -> Option<usize> {
        self.requests.iter().position(|&h| h == handle)
    }

    /// Timing discrepancy repair: amortises a difference
    /// between an unrequested timed request's recorded `nominal_start_time`
    /// and the queue's current `next_nominal_start_time` across every
    /// unrequested timed request, adjusting posted service times and
    /// dropping any that fall to zero.
    pub fn repair_timing_discrepancy(&mut self, arena: &mut RequestArena) {
        let unrequested: Vec<RequestHandle> = self.requests[self.first_unrequested..].to_vec();
        if unrequested.is_empty() {
            return;
        }
        let first_discrepancy = match arena.get(unrequested[0]) {
            Some(r) if r.timing.nominal_start_time != self.next_nominal_start_time => {
                self.next_nominal_start_time - r.timing.nominal_start_time
            }
            _ => return,
        };
        let n = unrequested.len() as i64;
        if n == 0 {
            return;
        }
        let share = first_discrepancy / n;
        let mut to_drop = Vec::new();
        for &h in &unrequested {
            if let Some(req) = arena.get_mut(h) {
                req.timing.nominal_start_time += first_discrepancy;
                req.timing.posted_service_time -= share;
                if req.timing.posted_service_time <= 0 {
                    to_drop.push(h);
                }
            }
        }
        for h in to_drop {
            if let Some(pos) = self.position_of(h) {
                self.requests.remove(pos);
                arena.remove(h);
            }
        }
    }
}
