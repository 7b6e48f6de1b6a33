//! The engine orchestrator.
//!
//! `Client` is the single owner of every queue, CID, primary channel and
//! the request arena. The application thread and the manager task
//! communicate only by acquiring [`ClientHandle`]'s management lock; the
//! manager, once it has the lock, may freely mutate anything reachable
//! from `Client`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::cid::{Cid, CidId, Transport as CidTransport};
use crate::config::JpipConfig;
use crate::databin::Cache;
use crate::error::{Error, Result};
use crate::model::{CodestreamMapper, ModelManager};
use crate::monitor::ChannelMonitor;
use crate::primary::{JpipReplyHeaders, PrimaryChannel};
use crate::query::{CNewHeader, QueryBuilder};
use crate::queue::{QueueId, RequestQueue, StatusFilter};
use crate::request::{ChunkGap, RequestArena, RequestHandle};
use crate::status::{Notifier, Status};
use crate::woi::WindowOfInterest;

/// Everything the manager task needs, guarded by a single management
/// lock.
pub struct Client {
    pub config: JpipConfig,
    pub arena: RequestArena,
    pub queues: HashMap<QueueId, RequestQueue>,
    pub cids: HashMap<CidId, Cid>,
    pub primaries: HashMap<CidId, PrimaryChannel>,
    pub cache: Box<dyn Cache>,
    pub model: ModelManager,
    /// The codestream-mapping collaborator `model`'s statements need to
    /// decide which data-bins are relevant to a WOI; `None` means no
    /// cache-model signalling is attached to outgoing requests.
    pub mapper: Option<Box<dyn CodestreamMapper>>,
    /// Each codestream's main-header bytes, needed by `mapper` and kept
    /// here rather than in the cache since not every `Cache` implementation
    /// wants to expose raw bin bytes for this.
    pub main_headers: HashMap<u64, Vec<u8>>,
    pub target_id: Option<String>,
    pub preferences: Option<String>,
    pub resource: Option<String>,
    pub subtarget: Option<String>,
    /// The CID freshly added queues attach to -- the session's first,
    /// `connect`-established channel, until a queue is explicitly moved
    /// by some future channel-migration call.
    default_cid: Option<CidId>,
    dirty_codestreams: HashSet<u64>,
    next_queue_id: u32,
    next_cid_id: u32,
    next_qid: u64,
    notifier: Option<Box<dyn Notifier>>,
    close_requested: bool,
    alive: bool,
    statuses: HashMap<QueueId, Status>,
}

impl Client {
    pub fn new(config: JpipConfig, cache: Box<dyn Cache>) -> Client {
        Client {
            config,
            arena: RequestArena::new(),
            queues: HashMap::new(),
            cids: HashMap::new(),
            primaries: HashMap::new(),
            cache,
            model: ModelManager::new(),
            mapper: None,
            main_headers: HashMap::new(),
            target_id: None,
            preferences: None,
            resource: None,
            subtarget: None,
            default_cid: None,
            dirty_codestreams: HashSet::new(),
            next_queue_id: 0,
            next_cid_id: 0,
            next_qid: 0,
            notifier: None,
            close_requested: false,
            alive: true,
            statuses: HashMap::new(),
        }
    }

    pub fn set_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    /// Stores the `pref=` value sent with every subsequent request.
    pub fn set_preferences(&mut self, pref: String) {
        self.preferences = Some(pref);
    }

    /// Attaches the codestream-mapping collaborator cache-model
    /// signalling needs; without one, requests carry no `model=` fields.
    pub fn set_mapper(&mut self, mapper: Box<dyn CodestreamMapper>) {
        self.mapper = Some(mapper);
    }

    /// Records a codestream's main-header bytes once its bin completes --
    /// `mapper` needs them to resolve which data-bins a WOI touches.
    pub fn note_main_header(&mut self, codestream_id: u64, bytes: Vec<u8>) {
        self.main_headers.insert(codestream_id, bytes);
    }

    /// Marks a codestream as having unreported cache changes, forcing the
    /// next request's model pass to rescan it regardless of its WOI.
    pub fn mark_codestream_dirty(&mut self, codestream_id: u64) {
        self.dirty_codestreams.insert(codestream_id);
    }

    /// Establishes the first CID/primary-channel pair of a session and
    /// records the target resource every subsequent request names until
    /// a `cid=` replaces it.
    pub fn connect(&mut self, transport: CidTransport, host: String, port: u16, resource: String) -> CidId {
        let cid_id = self.add_cid(transport);
        self.primaries.insert(cid_id, PrimaryChannel::new(host, port));
        self.resource = Some(resource);
        self.default_cid.get_or_insert(cid_id);
        cid_id
    }

    fn set_status(&mut self, queue_id: QueueId, status: Status) {
        self.statuses.insert(queue_id, status);
        if let Some(n) = &self.notifier {
            n.notify();
        }
    }

    pub fn status_of(&self, queue_id: QueueId) -> Option<&Status> {
        self.statuses.get(&queue_id)
    }

    pub fn add_queue(&mut self) -> QueueId {
        let id = QueueId::new(self.next_queue_id);
        self.next_queue_id += 1;
        self.queues.insert(id, RequestQueue::new(id));
        if let Some(cid_id) = self.default_cid {
            if let Some(cid) = self.cids.get_mut(&cid_id) {
                cid.attach_queue(id);
            }
        }
        self.set_status(id, Status::NotConnected);
        id
    }

    pub fn add_cid(&mut self, transport: CidTransport) -> CidId {
        let id = CidId::new(self.next_cid_id);
        self.next_cid_id += 1;
        self.cids.insert(id, Cid::new(id, transport, &self.config));
        id
    }

    /// `post_window`: posts a request onto `queue_id`'s tail.
    pub fn post_window(
        &mut self,
        queue_id: QueueId,
        woi: WindowOfInterest,
        preemptive: bool,
        custom_id: Option<String>,
        service_usecs: i64,
    ) -> Result<RequestHandle> {
        let is_only_queue = self.queues.len() == 1;
        let queue = self
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| Error::InvalidState(format!("no such queue {:?}", queue_id.value())))?;
        let handle = queue.post_window(&mut self.arena, woi, preemptive, custom_id, service_usecs, is_only_queue);
        self.set_status(queue_id, Status::InteractiveTransfer);
        Ok(handle)
    }

    /// `disconnect(queue_id, keep_transport_open, timeout, wait)`: marks
    /// the queue closing, drops its unrequested requests, and -- if this
    /// was the CID's last living queue -- appends a final empty
    /// `cclose`-carrying request. Does not itself block; `wait` is the
    /// caller's responsibility via the returned condvar pair in
    /// [`ClientHandle::disconnect`].
    pub fn disconnect(&mut self, queue_id: QueueId, timeout_usecs: i64, now: i64) -> Result<()> {
        let queue = self
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| Error::InvalidState(format!("no such queue {:?}", queue_id.value())))?;
        queue.close_when_idle = true;
        queue.disconnect_timeout_usecs = timeout_usecs;
        queue.disconnect_deadline = Some(now + timeout_usecs);
        queue.trim_timed_requests(&mut self.arena);
        self.set_status(queue_id, Status::Disconnected);
        Ok(())
    }

    pub fn remove_queue(&mut self, queue_id: QueueId) {
        if let Some(mut q) = self.queues.remove(&queue_id) {
            q.trim_timed_requests(&mut self.arena);
        }
        for cid in self.cids.values_mut() {
            cid.detach_queue(queue_id);
        }
        self.statuses.remove(&queue_id);
    }

    pub fn get_window_info(&self, queue_id: QueueId, filter: StatusFilter) -> Option<RequestHandle> {
        self.queues.get(&queue_id)?.window_info(&self.arena, filter)
    }

    pub fn is_alive(&self) -> bool {
        self.alive && !self.cids.is_empty()
    }

    fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Releases a CID and every queue attached only to it, after a fatal
    /// per-CID error.
    fn release_cid(&mut self, cid_id: CidId, err: &Error) {
        warn!("CID {:?} failed: {}", cid_id.value(), err);
        if let Some(cid) = self.cids.remove(&cid_id) {
            for q in cid.queues {
                self.set_status(q, Status::ConnectionClosedUnexpectedly);
            }
        }
        self.primaries.remove(&cid_id);
        if self.cids.is_empty() {
            self.alive = false;
        }
    }

    /// One scheduling pass: retires completed requests, releases queues
    /// that finished closing, then services every CID in turn. Purely
    /// in-memory bookkeeping plus query construction; actual byte
    /// transmission is driven by the manager loop feeding the chosen
    /// request's query string out through its `PrimaryChannel`.
    ///
    /// Public so a transport wiring or test harness can drive a pass
    /// directly instead of only through [`ClientHandle::run_manager`].
    pub fn schedule_pass(&mut self, now: i64) {
        self.reap_retirable();
        self.release_idle_queues();

        let cid_ids: Vec<CidId> = self.cids.keys().copied().collect();
        for cid_id in cid_ids {
            self.service_cid(cid_id, now);
        }
    }

    /// Retires every request across every queue that has become
    /// retirable (communication complete, dependencies resolved), per
    /// `RequestQueue::retire`'s head-of-incomplete-run gating.
    fn reap_retirable(&mut self) {
        let queue_ids: Vec<QueueId> = self.queues.keys().copied().collect();
        for queue_id in queue_ids {
            loop {
                let next = match self.queues.get(&queue_id) {
                    Some(q) => q.iter().find(|&h| self.arena.get(h).map(|r| r.is_retirable()).unwrap_or(false)),
                    None => break,
                };
                let Some(handle) = next else { break };
                let retired = match self.queues.get_mut(&queue_id) {
                    Some(q) => q.retire(&mut self.arena, handle),
                    None => break,
                };
                if !retired {
                    break;
                }
            }
        }
    }

    /// Drops every `close_when_idle` queue that has drained its
    /// in-flight and unrequested requests.
    fn release_idle_queues(&mut self) {
        let idle: Vec<QueueId> =
            self.queues.iter().filter(|(_, q)| q.close_when_idle && q.is_empty()).map(|(id, _)| *id).collect();
        for id in idle {
            debug!("queue {:?} idle and closing, releasing", id.value());
            self.remove_queue(id);
        }
    }

    /// Services one CID for this pass: abandons stale aux receivers,
    /// applies lag compensation and timed-request duration assignment,
    /// then asks the scheduler for its next requester and dispatches it.
    fn service_cid(&mut self, cid_id: CidId, now: i64) {
        let queue_ids: Vec<QueueId> = match self.cids.get(&cid_id) {
            Some(c) => c.queues.clone(),
            None => return,
        };
        if queue_ids.is_empty() {
            return;
        }

        let abandon_all = queue_ids
            .iter()
            .any(|id| self.queues.get(id).and_then(|q| q.disconnect_deadline).map(|d| now >= d).unwrap_or(false));
        let abandoned = match self.cids.get_mut(&cid_id) {
            Some(cid) => cid.find_gaps_to_abandon(now, abandon_all, &mut self.arena, &self.config),
            None => return,
        };

        self.apply_lag_compensation(cid_id, now);
        self.assign_timed_durations(cid_id, &queue_ids, now);

        let (outstanding_bytes, stateless) = self.cid_load(cid_id);
        let chosen = {
            let refs: Vec<&RequestQueue> = queue_ids.iter().filter_map(|id| self.queues.get(id)).collect();
            if refs.is_empty() {
                return;
            }
            match self.cids.get_mut(&cid_id) {
                Some(cid) => cid.find_next_requester(now, &refs, &self.arena, outstanding_bytes, stateless),
                None => return,
            }
        };
        let Some(idx) = chosen else { return };
        let queue_id = queue_ids[idx];
        let Some(handle) = self.queues.get(&queue_id).and_then(|q| q.unrequested().first().copied()) else {
            return;
        };

        let preemptive = self.arena.get(handle).map(|r| r.preemptive).unwrap_or(false);
        if preemptive {
            self.duplicate_preempted(cid_id, queue_id);
        }

        self.issue_request(cid_id, queue_id, handle, &abandoned, now);
    }

    /// The outstanding-byte count and stateless flag `find_next_requester`
    /// needs: a CID with nothing currently in flight starts its next
    /// request as a fresh, disjoint (stateless) group.
    fn cid_load(&self, cid_id: CidId) -> (u64, bool) {
        let Some(cid) = self.cids.get(&cid_id) else { return (0, true) };
        if cid.active_receivers.is_empty() {
            return (0, true);
        }
        let mut outstanding = 0u64;
        for &h in &cid.active_receivers {
            let Some(req) = self.arena.get(h) else { continue };
            if req.eor.response_terminated {
                continue;
            }
            if req.woi.byte_limit > 0 {
                outstanding += req.woi.byte_limit.saturating_sub(req.timing.received_body_bytes);
            }
        }
        (outstanding, false)
    }

    fn apply_lag_compensation(&mut self, cid_id: CidId, now: i64) {
        let Some(queue_ids) = self.cids.get(&cid_id).map(|c| c.queues.clone()) else { return };
        let timed_flags: Vec<bool> = queue_ids.iter().map(|id| self.queues.get(id).map(|q| q.timed_mode).unwrap_or(false)).collect();
        let mut qrefs: Vec<&mut RequestQueue> = queue_ids.iter().filter_map(|id| self.queues.get_mut(id)).collect();
        if qrefs.len() != queue_ids.len() {
            return;
        }
        if let Some(cid) = self.cids.get(&cid_id) {
            cid.lag_compensation(now, &mut qrefs, &timed_flags);
        }
    }

    /// Timed-request duration assignment (`target_duration`): repairs any
    /// posted/nominal-timing discrepancy on each timed queue's head, then
    /// stamps its target duration and end time before it can be chosen.
    fn assign_timed_durations(&mut self, cid_id: CidId, queue_ids: &[QueueId], now: i64) {
        let total_queues = queue_ids.len();
        let regular_empty_queues =
            queue_ids.iter().filter(|id| self.queues.get(id).map(|q| q.is_empty()).unwrap_or(true)).count();
        let smallest_last_noted = queue_ids
            .iter()
            .filter_map(|id| self.queues.get(id).map(|q| q.last_noted_target_duration))
            .filter(|&d| d > 0)
            .min()
            .unwrap_or(0);

        let Some(cid) = self.cids.get(&cid_id) else { return };
        for &qid in queue_ids {
            let Some(queue) = self.queues.get_mut(&qid) else { continue };
            if !queue.timed_mode || !queue.has_unrequested() {
                continue;
            }
            queue.repair_timing_discrepancy(&mut self.arena);
            let Some(handle) = queue.unrequested().first().copied() else { continue };
            let posted_service_time = self.arena.get(handle).map(|r| r.timing.posted_service_time).unwrap_or(0);
            let duration = cid.target_duration(posted_service_time, total_queues, regular_empty_queues, smallest_last_noted);
            if let Some(req) = self.arena.get_mut(handle) {
                req.timing.target_duration = duration;
                req.timing.target_end_time = now + duration;
            }
            queue.last_noted_target_duration = duration;
        }
    }

    /// Preemption duplication: before a preemptive request on
    /// `preempting_queue` goes out, every other queue sharing this CID
    /// with a still-unreplied active request gets that request
    /// duplicated onto its own tail, since the preemptive sibling's
    /// response may curtail or replace it on the wire before it finishes.
    fn duplicate_preempted(&mut self, cid_id: CidId, preempting_queue: QueueId) {
        let Some(other_queues) = self.cids.get(&cid_id).map(|c| c.queues.clone()) else { return };
        for queue_id in other_queues {
            if queue_id == preempting_queue {
                continue;
            }
            let handle = match self.queues.get(&queue_id) {
                Some(q) => q.window_info(&self.arena, StatusFilter::default()),
                None => None,
            };
            let Some(handle) = handle else { continue };
            let Some(req) = self.arena.get(handle) else { continue };
            if req.eor.reply_received || req.is_copy {
                continue;
            }
            let copy = req.spawn_copy(handle);
            let copy_handle = self.arena.insert(copy);
            if let Some(original) = self.arena.get_mut(handle) {
                original.next_copy = Some(copy_handle);
            }
            if let Some(queue) = self.queues.get_mut(&queue_id) {
                queue.enqueue_copy(copy_handle);
            }
            debug!("duplicated preempted request {:?} as {:?}", handle, copy_handle);
        }
    }

    /// Builds one request's outgoing query string, assigning it a fresh
    /// `qid` and attaching cache-model statements when `mapper` is set.
    /// Returns `(query, needs_cnew)`.
    fn build_query(&mut self, cid_id: CidId, handle: RequestHandle, abandoned: &[(u64, Vec<ChunkGap>)]) -> Option<(String, bool)> {
        let req = self.arena.get(handle)?;
        let woi = req.woi.clone();
        let barrier_qid = req.barrier_qid;

        let qid = self.next_qid;
        self.next_qid += 1;
        if let Some(req) = self.arena.get_mut(handle) {
            req.qid = Some(qid);
        }

        let cid = self.cids.get(&cid_id)?;
        let server_id = cid.server_id.clone();
        let stateless = cid.active_receivers.is_empty();
        let needs_cnew = server_id.is_none();

        let mut builder = QueryBuilder::new();
        match &server_id {
            Some(id) => {
                builder.cid(id);
            }
            None => {
                if let Some(resource) = &self.resource {
                    builder.target(resource);
                }
                if let Some(sub) = &self.subtarget {
                    builder.subtarget(sub);
                }
                builder.tid(self.target_id.as_deref());
                builder.stream_type_jpp();
                builder.cnew(&["http-tcp", "http-udp"]);
            }
        }
        builder.qid(qid);
        if let Some(b) = barrier_qid {
            builder.barrier(b);
        }
        builder.woi(&woi);
        if let Some(pref) = &self.preferences {
            builder.preferences(pref);
        }
        for (abandon_qid, gaps) in abandoned {
            builder.abandon(*abandon_qid, gaps);
        }

        if let Some(mapper) = self.mapper.as_deref() {
            let mut codestream_ids: Vec<u64> = woi.codestreams.iter().map(|r| r.first as u64).collect();
            if codestream_ids.is_empty() {
                codestream_ids.push(0);
            }
            let dirty = &self.dirty_codestreams;
            let out = self.model.statements_for_request(
                self.cache.as_ref(),
                mapper,
                &woi,
                &codestream_ids,
                &self.main_headers,
                stateless,
                |c| dirty.contains(&c),
                self.config.model_statement_byte_limit,
            );
            let mut by_stream: BTreeMap<u64, Vec<String>> = BTreeMap::new();
            for (stream, descriptor) in out.statements {
                by_stream.entry(stream).or_default().push(descriptor);
            }
            let sent_any = !by_stream.is_empty();
            for (stream, descriptors) in &by_stream {
                builder.model(*stream, descriptors);
            }
            if let Some(req) = self.arena.get_mut(handle) {
                req.new_elements = sent_any;
            }
        }

        Some((builder.build(), needs_cnew))
    }

    /// Issues `handle`: marks it `Issued` in memory, tells the CID and
    /// flow regulator about the request, and queues the built query
    /// string onto the CID's primary channel for the manager loop to
    /// write out.
    fn issue_request(&mut self, cid_id: CidId, queue_id: QueueId, handle: RequestHandle, abandoned: &[(u64, Vec<ChunkGap>)], now: i64) {
        let Some((query, _needs_cnew)) = self.build_query(cid_id, handle, abandoned) else { return };
        let byte_limit = self.arena.get(handle).map(|r| r.woi.byte_limit).unwrap_or(0);

        if let Some(req) = self.arena.get_mut(handle) {
            req.issue(now);
        }
        if let Some(q) = self.queues.get_mut(&queue_id) {
            q.note_issued(handle);
        }
        if let Some(cid) = self.cids.get_mut(&cid_id) {
            cid.note_request_sent(byte_limit > 0);
            cid.flow.note_request_issued(byte_limit == 0);
        }

        let host = self.primaries.get(&cid_id).map(|p| p.host.clone()).unwrap_or_default();
        let path = self.resource.clone().unwrap_or_default();
        if let Some(primary) = self.primaries.get_mut(&cid_id) {
            if query.len() > 2000 {
                primary.queue_post_request(&path, &host, true, &query);
            } else {
                let path_and_query = format!("{}?{}", path, query);
                primary.queue_request(&path_and_query, &host, true);
            }
        }

        debug!("issued request on queue {:?} via CID {:?}", queue_id.value(), cid_id.value());
    }

    /// Processes one primary channel's parsed reply headers: reconciles
    /// the session's `tid`, spawns a new CID/primary pair on a
    /// `JPIP-cnew` handshake, and marks the originating request replied.
    /// Called by the transport wiring once `PrimaryChannel::feed_header_bytes`
    /// returns a complete header block.
    pub fn note_reply_headers(
        &mut self,
        cid_id: CidId,
        queue_id: QueueId,
        handle: RequestHandle,
        headers: &JpipReplyHeaders,
        now: i64,
    ) -> Result<()> {
        if let Some(tid) = &headers.tid {
            match &self.target_id {
                Some(existing) if existing != tid => {
                    return Err(Error::TargetChanged(existing.clone(), tid.clone()));
                }
                None => self.target_id = Some(tid.clone()),
                _ => {}
            }
        }

        if let Some(cnew) = &headers.cnew {
            self.adopt_cnew(cid_id, cnew);
        }

        let nominal_start_time = self.arena.get(handle).map(|r| r.timing.nominal_start_time);
        let timed = self.arena.get(handle).map(|r| r.timing.posted_service_time > 0).unwrap_or(false);

        if let Some(req) = self.arena.get_mut(handle) {
            req.reply_received(now);
        }
        if let Some(q) = self.queues.get_mut(&queue_id) {
            q.note_replied(handle);
        }
        let overlap = self.cids.get_mut(&cid_id).map(|cid| cid.register_active_receiver(handle, &self.arena));
        if let Some(overlap) = overlap {
            if let Some(req) = self.arena.get_mut(handle) {
                req.timing.overlap_bytes = overlap;
            }
        }

        if timed {
            if let Some(nominal) = nominal_start_time {
                let queue_ids = self.cids.get(&cid_id).map(|c| c.queues.clone()).unwrap_or_default();
                let mut qrefs: Vec<&mut RequestQueue> =
                    self.queues.values_mut().filter(|q| queue_ids.contains(&q.id)).collect();
                if let Some(cid) = self.cids.get_mut(&cid_id) {
                    cid.sync_timing(now, nominal, &mut qrefs);
                }
            }
        }

        Ok(())
    }

    /// Spawns the CID/primary pair a `JPIP-cnew` reply announces.
    /// `host=same` reuses the host of the primary channel that carried
    /// the reply.
    fn adopt_cnew(&mut self, origin_cid: CidId, cnew: &CNewHeader) {
        let Some(cid_str) = &cnew.cid else { return };
        let transport = match cnew.transport.as_deref() {
            Some("http-tcp") => CidTransport::HttpTcp,
            Some("http-udp") => CidTransport::HttpUdp,
            _ => CidTransport::HttpOnly,
        };
        let new_cid_id = self.add_cid(transport);
        if let Some(cid) = self.cids.get_mut(&new_cid_id) {
            cid.server_id = Some(cid_str.clone());
        }
        let origin_host = self.primaries.get(&origin_cid).map(|p| p.host.clone());
        if let Some(port) = cnew.port {
            let host = match cnew.host.as_deref() {
                Some("same") | None => origin_host,
                Some(h) => Some(h.to_string()),
            };
            if let Some(host) = host {
                self.primaries.insert(new_cid_id, PrimaryChannel::new(host, port));
            }
        }
        debug!("adopted JPIP-cnew channel {} as {:?}", cid_str, new_cid_id.value());
    }
}

/// Thread-safe handle to a [`Client`]: the application thread's public
/// API, each call acquiring the management lock, mutating, and waking
/// the manager task.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<Mutex<Client>>,
    wake: Arc<Condvar>,
}

impl ClientHandle {
    pub fn new(config: JpipConfig, cache: Box<dyn Cache>) -> ClientHandle {
        ClientHandle { inner: Arc::new(Mutex::new(Client::new(config, cache))), wake: Arc::new(Condvar::new()) }
    }

    pub fn add_queue(&self) -> QueueId {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.add_queue();
        self.wake.notify_all();
        id
    }

    pub fn post_window(
        &self,
        queue_id: QueueId,
        woi: WindowOfInterest,
        preemptive: bool,
        custom_id: Option<String>,
        service_usecs: i64,
    ) -> Result<RequestHandle> {
        let mut guard = self.inner.lock().unwrap();
        let handle = guard.post_window(queue_id, woi, preemptive, custom_id, service_usecs)?;
        self.wake.notify_all();
        Ok(handle)
    }

    pub fn disconnect(&self, queue_id: QueueId, timeout_usecs: i64, now: i64, wait: bool) -> Result<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.disconnect(queue_id, timeout_usecs, now)?;
        }
        self.wake.notify_all();
        if wait {
            let guard = self.inner.lock().unwrap();
            let _unused = self
                .wake
                .wait_timeout_while(guard, Duration::from_micros(timeout_usecs.max(0) as u64), |c| {
                    c.queues.contains_key(&queue_id)
                })
                .unwrap();
        }
        Ok(())
    }

    /// `close()`: signals the manager loop's `close_requested` flag; the
    /// manager observes it on its next lock acquisition and exits.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.request_close();
        drop(guard);
        self.wake.notify_all();
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().unwrap().is_alive()
    }

    pub fn get_window_info(&self, queue_id: QueueId, filter: StatusFilter) -> Option<RequestHandle> {
        self.inner.lock().unwrap().get_window_info(queue_id, filter)
    }

    /// Runs the manager loop on the calling thread until `close()` is
    /// called or every CID has died. `monitor` is polled between
    /// scheduling passes for socket readiness and application wakeups;
    /// actual chunk feeding (`cid.process_return_data`,
    /// `primary.feed_body_bytes`) is driven by the readiness results,
    /// which a concrete transport wiring (outside this engine's scope)
    /// supplies.
    pub fn run_manager(&self, monitor: &mut ChannelMonitor, now: impl Fn() -> i64) {
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if guard.close_requested || !guard.is_alive() {
                    break;
                }
                guard.schedule_pass(now());
            }
            match monitor.run_once(64, Some(Duration::from_millis(200))) {
                Ok(_ready) => {}
                Err(e) => {
                    warn!("channel monitor error: {}", e);
                }
            }
        }
    }

    /// Reports a fatal per-CID error observed while servicing a socket;
    /// called by the transport wiring outside the management lock's
    /// critical sections, re-acquiring it only for the duration of the
    /// call.
    pub fn report_cid_error(&self, cid_id: CidId, err: Error) {
        let mut guard = self.inner.lock().unwrap();
        guard.release_cid(cid_id, &err);
        drop(guard);
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::databin::MemoryCache;

    #[test]
    fn add_queue_then_post_window() {
        let client = ClientHandle::new(JpipConfig::default(), Box::new(MemoryCache::new()));
        let q = client.add_queue();
        let handle = client
            .post_window(q, WindowOfInterest::full_image(1024, 1024), false, None, 0)
            .unwrap();
        let info = client.get_window_info(q, StatusFilter::default());
        assert_eq!(info, Some(handle));
    }

    #[test]
    fn close_marks_manager_loop_for_exit() {
        let client = ClientHandle::new(JpipConfig::default(), Box::new(MemoryCache::new()));
        client.close();
        let guard = client.inner.lock().unwrap();
        assert!(guard.close_requested);
    }

    #[test]
    fn is_alive_false_with_no_cids() {
        let client = ClientHandle::new(JpipConfig::default(), Box::new(MemoryCache::new()));
        assert!(!client.is_alive());
    }
}
