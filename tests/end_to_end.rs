//! End-to-end scenarios, driven against a hand-built mock
//! server: fixed byte buffers standing in for what a real JPIP server
//! would have written, fed through the same parsing/state-machine code
//! the manager loop uses, with no real socket involved.

use jpip_client::aux::tcp::{receive_chunk, write_to_cache};
use jpip_client::aux::udp;
use jpip_client::aux::vbas::{self, Message, VbasContext};
use jpip_client::aux::Preamble;
use jpip_client::cachefile;
use jpip_client::cid::{Cid, CidId, Transport};
use jpip_client::client::Client;
use jpip_client::config::JpipConfig;
use jpip_client::databin::{BinClass, Cache, DataBinId, MemoryCache};
use jpip_client::model::{CodestreamMapper, ModelManager};
use jpip_client::primary::{JpipReplyHeaders, PrimaryChannel};
use jpip_client::query::CNewHeader;
use jpip_client::queue::{QueueId, RequestQueue, StatusFilter};
use jpip_client::request::{ChunkGap, EorReason, RequestArena, RequestState};
use jpip_client::woi::WindowOfInterest;

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

fn main_header_message(length: usize) -> Vec<u8> {
    // class_delta=3 (new class + codestream), is_final=0, extend=0,
    // nibble=0: bin_id=0 with no continuation byte.
    let mut msg = vec![(3 << 5) | 0x00];
    msg.extend(encode_vbas(0)); // class 0 (main header)
    msg.extend(encode_vbas(0)); // codestream 0
    msg.extend(encode_vbas(0)); // range_offset
    msg.extend(encode_vbas(length as u64));
    msg.extend(vec![b'x'; length]);
    msg
}

fn eor(reason: u8) -> Vec<u8> {
    vec![0x00, reason]
}

/// Scenario 1: single stateless GET, complete response.
#[test]
fn stateless_get_complete_response() {
    let mut body = main_header_message(400);
    body.extend(eor(1)); // image_done

    let mut channel = PrimaryChannel::new("server.example".into(), 80);
    let header_block = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpp-stream\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut raw = header_block.into_bytes();
    raw.extend(body);

    let headers = channel.feed_header_bytes(&raw, 16384).unwrap().unwrap();
    assert_eq!(headers.status, 200);
    let (payload, done) = channel.feed_body_bytes(&[]).unwrap();
    assert!(done);

    let mut ctx = VbasContext::default();
    let (messages, _) = vbas::parse_all(&payload, &mut ctx).unwrap();
    let mut cache = MemoryCache::new();
    write_to_cache(&messages, &mut cache);

    assert!(matches!(messages.last(), Some(Message::Eor(1))));
    let bin = cache.get(&DataBinId::new(BinClass::MainHeader, 0, 0)).unwrap();
    assert_eq!(bin.bytes.len(), 400);
    assert!(!bin.is_complete); // is_final was 0 on the data message itself
}

fn aux_chunk(seq: u32, qid_low: u16, payload: Vec<u8>) -> Vec<u8> {
    let preamble = Preamble { chunk_length: (8 + payload.len()) as u16, qid_low, seq };
    let mut raw = preamble.to_bytes().to_vec();
    raw.extend(payload);
    raw
}

/// Scenario 2: HTTP-TCP session with a `JPIP-cnew` handshake, eight aux
/// chunks carrying one precinct data-bin, and a trailing `window_done`
/// folded into the last chunk's payload.
#[test]
fn http_tcp_session_with_cnew_and_aux_chunks() {
    let mut client = Client::new(JpipConfig::default(), Box::new(MemoryCache::new()));
    let origin_cid = client.connect(Transport::HttpOnly, "server.example".into(), 80, "image.jp2".into());
    let q = client.add_queue();
    let r = client.post_window(q, WindowOfInterest::full_image(1024, 1024), false, None, 0).unwrap();

    client.schedule_pass(0);
    assert_eq!(client.arena.get(r).unwrap().state, RequestState::Issued);
    let qid = client.arena.get(r).unwrap().qid.unwrap();

    let headers = JpipReplyHeaders {
        status: 200,
        content_type: Some("image/jpp-stream".into()),
        body: None,
        persistent: true,
        tid: Some("session-1".into()),
        cnew: Some(CNewHeader {
            cid: Some("C1".into()),
            transport: Some("http-tcp".into()),
            host: Some("same".into()),
            port: Some(8081),
            auxport: None,
            path: None,
        }),
        fsiz: None,
        len: None,
    };
    client.note_reply_headers(origin_cid, q, r, &headers, 1000).unwrap();

    assert_eq!(client.target_id.as_deref(), Some("session-1"));
    assert_eq!(client.cids.len(), 2);
    let new_cid_id = *client.cids.keys().find(|&&id| id != origin_cid).unwrap();
    assert_eq!(client.cids[&new_cid_id].server_id.as_deref(), Some("C1"));
    assert_eq!(client.primaries.get(&new_cid_id).map(|p| p.host.clone()), Some("server.example".to_string()));
    assert_eq!(client.primaries.get(&new_cid_id).map(|p| p.port), Some(8081));

    // Eight aux chunks, each carrying one precinct data-bin fragment; the
    // first establishes class/codestream via class_delta=3, the rest
    // reuse it via class_delta=1. The eighth is final and folds a
    // trailing window_done EOR into the same chunk.
    let mut ctx = VbasContext::default();
    let mut rtt_set = false;
    let mut last_messages = Vec::new();
    for i in 0u32..8 {
        let is_last = i == 7;
        let b0 = if i == 0 { 3 << 5 } else { (1 << 5) | if is_last { 0x10 } else { 0x00 } };
        let mut payload = vec![b0];
        if i == 0 {
            payload.extend(encode_vbas(4)); // wire class 4 (even) -> precinct
            payload.extend(encode_vbas(0)); // codestream 0
        }
        payload.extend(encode_vbas((i as u64) * 8)); // range_offset
        payload.extend(encode_vbas(8)); // range_length
        payload.extend_from_slice(&[b'p'; 8]);
        if is_last {
            payload.extend(eor(2)); // window_done
        }

        let raw = aux_chunk(i, qid as u16, payload);
        let result = receive_chunk(&raw, &mut ctx, client.cache.as_mut()).unwrap();

        let now = 1000 + (i as i64 + 1) * 2000;
        if !rtt_set {
            rtt_set = true;
            let issue_time = client.arena.get(r).unwrap().timing.request_issue_time;
            if let Some(cid) = client.cids.get_mut(&new_cid_id) {
                cid.rtt_usecs = now - issue_time;
            }
        }
        if let Some(req) = client.arena.get_mut(r) {
            req.chunk_received(now, result.body_bytes as u64, result.body_bytes as u64);
        }
        if is_last {
            last_messages = result.messages;
        }
    }

    assert!(client.cids[&new_cid_id].rtt_usecs > 0);
    assert!(matches!(last_messages.last(), Some(Message::Eor(2))));

    let bin = client.cache.get(&DataBinId::new(BinClass::Precinct, 0, 0)).unwrap();
    assert_eq!(bin.bytes.len(), 64);
    assert!(bin.is_complete);

    if let Some(req) = client.arena.get_mut(r) {
        req.set_response_terminated(EorReason::WindowDone, 17000);
    }
    assert!(client.arena.get(r).unwrap().is_retirable());
}

/// Scenario 3: UDP loss and abandon.
#[test]
fn udp_loss_then_abandon() {
    let mut arena = RequestArena::new();
    let mut queue = RequestQueue::new(QueueId::new(0));
    let handle = queue.post_window(&mut arena, WindowOfInterest::full_image(64, 64), false, None, 0, true);
    let req = arena.get_mut(handle).unwrap();
    req.qid = Some(1);
    req.chunk_gaps = vec![ChunkGap { from: 0, to: None }];
    req.issue(0);

    // Datagrams for seq 0, 2, 3 arrive; seq 1 never does.
    for seq in [0u64, 2, 3] {
        udp::mark_received(&mut arena.get_mut(handle).unwrap().chunk_gaps, seq);
        arena.get_mut(handle).unwrap().chunk_received(seq as i64 * 1000, 10, 12);
    }
    let gaps = arena.get(handle).unwrap().chunk_gaps.clone();
    assert_eq!(gaps, vec![ChunkGap { from: 1, to: Some(1) }, ChunkGap { from: 4, to: None }]);

    let config = JpipConfig::default();
    let mut cid = Cid::new(CidId::new(0), Transport::HttpUdp, &config);
    cid.rtt_usecs = 1000;
    cid.active_receivers.push(handle);

    let now = config.abandon_factor as i64 * cid.rtt_usecs + 5000;
    let abandoned = cid.find_gaps_to_abandon(now, false, &mut arena, &config);
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].0, 1);

    let req = arena.get(handle).unwrap();
    assert!(req.untrusted);
    assert!(req.eor.response_terminated);
    assert!(cid.active_receivers.is_empty());
}

/// Scenario 4: preemption duplicates an unreplied sibling request,
/// driven through `Client::schedule_pass` rather than calling
/// `Request::spawn_copy` by hand.
#[test]
fn preemption_duplicates_unreplied_request() {
    let mut client = Client::new(JpipConfig::default(), Box::new(MemoryCache::new()));
    client.connect(Transport::HttpOnly, "server.example".into(), 80, "image.jp2".into());
    let q1 = client.add_queue();
    let q2 = client.add_queue();

    // R1 is posted but not yet issued; a preemptive R2 arrives on another
    // queue before the next pass, so the same pass that picks R2 over R1
    // (round-robin favors the freshly-attached q2) must duplicate R1
    // first, since issuing R2 may curtail whatever R1's reply would have
    // been.
    let r1 = client.post_window(q1, WindowOfInterest::full_image(1024, 1024), false, None, 0).unwrap();
    let r2 = client.post_window(q2, WindowOfInterest::full_image(1024, 1024), true, None, 0).unwrap();
    client.schedule_pass(0);

    assert_eq!(client.arena.get(r2).unwrap().state, RequestState::Issued);
    assert_eq!(client.arena.get(r1).unwrap().state, RequestState::Posted);
    let r1_prime = client.arena.get(r1).unwrap().next_copy.expect("r1 was duplicated");
    assert_ne!(r1_prime, r1);
    assert_eq!(client.arena.get(r1_prime).unwrap().copy_src, Some(r1));
    assert!(client.arena.get(r1_prime).unwrap().is_copy);
    assert_eq!(client.get_window_info(q1, StatusFilter::default()), Some(r1_prime));

    // R2's reply covers R1's WOI: R1 retires trusted, R1' can be dropped.
    client.arena.get_mut(r2).unwrap().reply_received(20);
    client.arena.get_mut(r2).unwrap().set_response_terminated(EorReason::WindowDone, 30);
    client.arena.get_mut(r1).unwrap().reply_received(30);
    client.arena.get_mut(r1).unwrap().set_response_terminated(EorReason::WindowDone, 30);
    assert!(client.arena.get(r1).unwrap().is_retirable());

    client.arena.remove(r1_prime);
    assert!(client.arena.get(r1_prime).is_none());
}

/// Scenario 5: timed-request pacing.
#[test]
fn timed_request_pacing_holds_fundamental_equation() {
    let config = JpipConfig::default();
    let cid = Cid::new(CidId::new(0), Transport::HttpOnly, &config);

    // Two queues, each posting service_usecs=1_000_000 requests
    // simultaneously: N'=2 (neither queue is regular-empty), so each
    // request pair's target_duration is 500_000.
    let duration = cid.target_duration(1_000_000, 2, 0, 0);
    assert_eq!(duration, 500_000);

    let mut q1 = RequestQueue::new(QueueId::new(0));
    let mut q2 = RequestQueue::new(QueueId::new(1));

    let mut tc = 0i64;
    for _ in 0..3 {
        q1.next_nominal_start_time += duration;
        q2.next_nominal_start_time += duration;
        tc += duration;
    }

    assert_eq!(tc, 1_500_000);
    assert_eq!(q1.next_nominal_start_time, q2.next_nominal_start_time);
    let n = 2i64;
    assert_eq!(n * tc, q1.next_nominal_start_time + q2.next_nominal_start_time);
}

struct AllBins(Vec<DataBinId>);
impl CodestreamMapper for AllBins {
    fn relevant_databins(&self, _c: u64, _woi: &WindowOfInterest, _h: &[u8]) -> Vec<DataBinId> {
        self.0.clone()
    }
}

/// Scenario 6: cache file loaded prevents re-fetch.
#[test]
fn loaded_cache_file_drives_model_statements_on_first_request() {
    let mut seed = MemoryCache::new();
    let id = DataBinId::new(BinClass::Precinct, 0, 9);
    seed.add_to_databin(id, 0, b"already-have-this", true);

    let header = cachefile::CacheFileHeader {
        preamble: None,
        preamble_bins: None,
        host: "server.example".into(),
        resource: "image.jp2".into(),
        target: "image.jp2".into(),
        sub_target: "".into(),
        target_id: "same-target".into(),
    };
    let mut buf = Vec::new();
    cachefile::write(&mut buf, &header, &seed).unwrap();

    let mut cache = MemoryCache::new();
    let read_header = cachefile::read(&buf, &mut cache).unwrap();
    assert_eq!(read_header.target_id, "same-target");

    let mapper = AllBins(vec![id]);
    let mut model = ModelManager::new();
    let headers = std::collections::HashMap::new();
    let out = model.statements_for_request(
        &cache,
        &mapper,
        &WindowOfInterest::full_image(1024, 1024),
        &[0],
        &headers,
        true,
        |_| false,
        16_000,
    );

    // The loaded bin is new to the model manager's "sent" bookkeeping, so
    // it produces a statement on the very first request -- this is what
    // the duplicate initial request's `new_elements=true` is grounded on.
    assert_eq!(out.statements, vec![(0, "P9".to_string())]);
    assert!(!out.truncated);
}
