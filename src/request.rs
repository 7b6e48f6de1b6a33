//! Per-request state machine and dependency graph.
//!
//! Requests are addressed by a stable [`RequestHandle`] (arena index plus
//! generation) rather than a pointer, per the "cyclic / multi-linked
//! structures" design note: a request sits on up to three lists at once
//! (its queue, the primary channel's active-request list, the CID's
//! active-receiver list) plus a copy-chain, and a generation-checked
//! handle sidesteps the aliasing that real back-links would require.

use crate::queue::QueueId;
use crate::woi::WindowOfInterest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

/// `Posted -> Issued -> Replied -> Receiving -> ResponseDone ->
/// CommunicationComplete -> Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    Posted,
    Issued,
    Replied,
    Receiving,
    ResponseDone,
    CommunicationComplete,
    Complete,
}

/// Per-request EOR bookkeeping: the first eight fields track the reasons
/// a reply can report completion; `response_limit_reached` and
/// `nonspecific_eor` cover cases the wire format doesn't name directly
/// (a server-imposed cap, and an abandoned/untrusted request).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EorFlags {
    pub response_terminated: bool,
    pub reply_received: bool,
    pub window_completed: bool,
    pub quality_limit_reached: bool,
    pub byte_limit_reached: bool,
    pub session_limit_reached: bool,
    pub image_done: bool,
    pub chunk_received: bool,
    pub response_limit_reached: bool,
    pub nonspecific_eor: bool,
}

/// One of the reason codes carried by an EOR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EorReason {
    ImageDone = 1,
    WindowDone = 2,
    QualityLimit = 3,
    ByteLimit = 4,
    SessionLimit = 5,
    ResponseLimit = 6,
    Nonspecific = 7,
}

impl EorReason {
    pub fn from_code(code: u8) -> Option<EorReason> {
        use EorReason::*;
        Some(match code {
            1 => ImageDone,
            2 => WindowDone,
            3 => QualityLimit,
            4 => ByteLimit,
            5 => SessionLimit,
            6 => ResponseLimit,
            7 => Nonspecific,
            _ => return None,
        })
    }

    /// Whether this EOR reason tells the client anything useful about
    /// window completeness -- used by the "no-informative-EOR" clause of
    /// the completion-gating invariant.
    pub fn is_informative(self) -> bool {
        !matches!(self, EorReason::Nonspecific)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTiming {
    pub request_issue_time: i64,
    pub last_event_time: i64,
    pub received_service_time: i64,
    pub nominal_start_time: i64,
    pub target_end_time: i64,
    pub target_duration: i64,
    pub disparity_compensation: i64,
    pub posted_service_time: i64,
    pub overlap_bytes: u64,
    pub received_body_bytes: u64,
    pub received_message_bytes: u64,
}

/// A gap in the chunk sequence of a request transported on an unreliable
/// (UDP) channel. `to = None` means open-ended, `[from, inf)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGap {
    pub from: u64,
    pub to: Option<u64>,
}

impl ChunkGap {
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.from && self.to.map_or(true, |to| seq <= to)
    }
}

/// An entry in a request's dependency list: another request whose
/// response must complete before this request's EOR may be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRef {
    pub queue_id: QueueId,
    pub qid: u64,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub queue_id: QueueId,
    pub woi: WindowOfInterest,
    pub effective_woi: Option<WindowOfInterest>,
    pub qid: Option<u64>,
    pub group_stamp: u64,
    pub cum_group_byte_limit: u64,
    pub byte_limit: u64,
    pub preemptive: bool,
    pub new_elements: bool,
    pub obliterating: bool,
    pub untrusted: bool,
    pub is_copy: bool,
    pub completion_noted: bool,
    pub eor: EorFlags,
    pub timing: RequestTiming,
    pub chunk_gaps: Vec<ChunkGap>,
    pub dependencies: Vec<DependencyRef>,
    pub copy_src: Option<RequestHandle>,
    pub next_copy: Option<RequestHandle>,
    pub custom_id: Option<String>,
    /// `barrier=<qid>`: server-side ordering hint tying this request to
    /// another queue's completion.
    pub barrier_qid: Option<u64>,
    pub state: RequestState,
}

impl Request {
    pub fn new(queue_id: QueueId, woi: WindowOfInterest, preemptive: bool) -> Request {
        Request {
            queue_id,
            woi,
            effective_woi: None,
            qid: None,
            group_stamp: 0,
            cum_group_byte_limit: 0,
            byte_limit: 0,
            preemptive,
            new_elements: false,
            obliterating: false,
            untrusted: false,
            is_copy: false,
            completion_noted: false,
            eor: EorFlags::default(),
            timing: RequestTiming::default(),
            chunk_gaps: Vec::new(),
            dependencies: Vec::new(),
            copy_src: None,
            next_copy: None,
            custom_id: None,
            barrier_qid: None,
            state: RequestState::Posted,
        }
    }

    pub fn issue(&mut self, now: i64) {
        self.timing.request_issue_time = now;
        self.timing.last_event_time = now;
        self.state = RequestState::Issued;
    }

    pub fn reply_received(&mut self, now: i64) {
        self.eor.reply_received = true;
        self.timing.last_event_time = now;
        if self.state < RequestState::Replied {
            self.state = RequestState::Replied;
        }
    }

    pub fn chunk_received(&mut self, now: i64, body_bytes: u64, message_bytes: u64) {
        self.eor.chunk_received = true;
        self.timing.last_event_time = now;
        self.timing.received_body_bytes += body_bytes;
        self.timing.received_message_bytes += message_bytes;
        if self.state < RequestState::Receiving {
            self.state = RequestState::Receiving;
        }
    }

    /// Records an EOR message. `target_end_time` is reset to -1 (the
    /// "no pending timed deadline" sentinel); `reconcile_timed_request`
    /// uses that to settle this request's CID-level timing disparity,
    /// which is the caller's responsibility since it needs the CID and
    /// this type doesn't have access to one.
    pub fn set_response_terminated(&mut self, reason: EorReason, now: i64) {
        self.eor.response_terminated = true;
        self.timing.last_event_time = now;
        self.timing.target_end_time = -1;
        match reason {
            EorReason::ImageDone => self.eor.image_done = true,
            EorReason::WindowDone => self.eor.window_completed = true,
            EorReason::QualityLimit => self.eor.quality_limit_reached = true,
            EorReason::ByteLimit => self.eor.byte_limit_reached = true,
            EorReason::SessionLimit => self.eor.session_limit_reached = true,
            EorReason::ResponseLimit => self.eor.response_limit_reached = true,
            EorReason::Nonspecific => self.eor.nonspecific_eor = true,
        }
        self.state = RequestState::ResponseDone;
    }

    pub fn mark_untrusted(&mut self) {
        self.untrusted = true;
    }

    /// Completion gating restricted to the communication half of a
    /// request's lifecycle (ignores dependencies).
    pub fn communication_complete(&self) -> bool {
        self.eor.response_terminated && self.eor.reply_received && self.chunk_gaps.is_empty()
    }

    /// Whether none of this request's recorded EOR reasons says anything
    /// useful about window completeness.
    fn eor_uninformative(&self) -> bool {
        !(self.eor.image_done
            || self.eor.window_completed
            || self.eor.quality_limit_reached
            || self.eor.byte_limit_reached
            || self.eor.session_limit_reached
            || self.eor.response_limit_reached)
    }

    /// Full retirement gate: communication complete, and
    /// dependencies are either absent, moot (untrusted), or the EOR gave
    /// no useful information to begin with.
    pub fn is_retirable(&self) -> bool {
        self.communication_complete()
            && (self.untrusted || self.dependencies.is_empty() || self.eor_uninformative())
            && self.state != RequestState::Complete
    }

    pub fn mark_complete(&mut self) {
        self.state = RequestState::Complete;
    }

    /// Removes or replaces a dependency entry pointing at `completed`:
    /// replace with the predecessor if it's named and still incomplete,
    /// else drop it. When `force_untrusted` the request is additionally
    /// marked untrusted (used when the completing request was abandoned).
    pub fn resolve_dependency(
        &mut self,
        completed: DependencyRef,
        predecessor: Option<DependencyRef>,
        force_untrusted: bool,
    ) {
        if force_untrusted && self.dependencies.iter().any(|d| *d == completed) {
            self.mark_untrusted();
        }
        self.dependencies.retain_mut(|d| {
            if *d != completed {
                return true;
            }
            match predecessor {
                Some(p) => {
                    *d = p;
                    true
                }
                None => false,
            }
        });
    }

    /// Produces a duplicate to absorb preemption or carry leftover
    /// service time forward. The copy inherits WOI and preemptivity;
    /// `new_elements` is reset since cache-model statements were already
    /// sent with the original.
    pub fn spawn_copy(&self, self_handle: RequestHandle) -> Request {
        let mut copy = self.clone();
        copy.is_copy = true;
        copy.new_elements = false;
        copy.qid = None;
        copy.state = RequestState::Posted;
        copy.eor = EorFlags::default();
        copy.chunk_gaps.clear();
        copy.dependencies.clear();
        copy.copy_src = Some(self_handle);
        copy.next_copy = None;
        copy
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty { generation: u32, next_free: Option<u32> },
    Occupied { generation: u32 },
}

/// Arena owning every live [`Request`], addressed by [`RequestHandle`].
/// Owned by the single orchestrator (`client::Client`), per the "global
/// mutable state" design note; queues/CIDs/primaries only ever hold
/// handles into it.
#[derive(Debug, Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    requests: Vec<Option<Request>>,
    free_head: Option<u32>,
}

impl RequestArena {
    pub fn new() -> RequestArena {
        RequestArena::default()
    }

    pub fn insert(&mut self, request: Request) -> RequestHandle {
        if let Some(idx) = self.free_head {
            let (generation, next_free) = match self.slots[idx as usize] {
                Slot::Empty { generation, next_free } => (generation, next_free),
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.free_head = next_free;
            self.slots[idx as usize] = Slot::Occupied { generation };
            self.requests[idx as usize] = Some(request);
            RequestHandle { index: idx, generation }
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { generation: 0 });
            self.requests.push(Some(request));
            RequestHandle { index: idx, generation: 0 }
        }
    }

    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation } if *generation == handle.generation => {
                self.requests[handle.index as usize].as_ref()
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation } if *generation == handle.generation => {
                self.requests[handle.index as usize].as_mut()
            }
            _ => None,
        }
    }

    /// Frees the slot. Callers must have already unlinked the handle from
    /// every list it appeared on (queue, primary active-request, CID
    /// active-receiver) -- the arena has no way to check that itself.
    pub fn remove(&mut self, handle: RequestHandle) -> Option<Request> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation } if *generation == handle.generation => {
                let request = self.requests[handle.index as usize].take();
                self.slots[handle.index as usize] = Slot::Empty {
                    generation: generation.wrapping_add(1),
                    next_free: self.free_head,
                };
                self.free_head = Some(handle.index);
                request
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::QueueId;
    use crate::woi::WindowOfInterest;

    fn sample_request() -> Request {
        Request::new(QueueId::new(0), WindowOfInterest::full_image(1024, 1024), false)
    }

    #[test]
    fn arena_handle_is_generation_checked() {
        let mut arena = RequestArena::new();
        let h = arena.insert(sample_request());
        assert!(arena.get(h).is_some());
        arena.remove(h).unwrap();
        assert!(arena.get(h).is_none());
        let h2 = arena.insert(sample_request());
        assert_eq!(h2, RequestHandle { index: 0, generation: 1 });
        assert!(arena.get(h).is_none());
        assert!(arena.get(h2).is_some());
    }

    #[test]
    fn completion_gating() {
        let mut r = sample_request();
        assert!(!r.is_retirable());
        r.set_response_terminated(EorReason::WindowDone, 10);
        assert!(!r.communication_complete()); // reply_received not set
        r.reply_received(10);
        assert!(r.communication_complete());
        assert!(r.is_retirable());
    }

    #[test]
    fn untrusted_dependency_is_moot() {
        let mut r = sample_request();
        r.dependencies.push(DependencyRef { queue_id: QueueId::new(1), qid: 3 });
        r.set_response_terminated(EorReason::ImageDone, 0);
        r.reply_received(0);
        assert!(!r.is_retirable());
        r.mark_untrusted();
        assert!(r.is_retirable());
    }
}
