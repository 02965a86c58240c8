//! two-node loopback tests: handshake, delivery, ping liveness, stale
//! enqueue rejection, and reconnection.
//!
//! each node binds its own loopback address (127.0.0.1 / 127.0.0.2) so the
//! accept path can identify peers by source ip, the same way real
//! deployments identify peers by NIC address.

use bytes::Bytes;
use mesh_transport::{
    BlockChain, BodyChain, ClusterConfig, ClusterEvents, ClusterMachine, ClusterRuntime,
    InMessage, MessageHandler, MsgHeader, OutData, Priority, SessionId, SessionLayer,
    SessionRoute, TransportError,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const NODE_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const NODE_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// collaborator stub recording everything the transport hands it.
struct Harness {
    route_call_func: AtomicBool,
    received: Mutex<Vec<(SessionId, u64, i32, Vec<u8>)>>,
    inbox: Mutex<Vec<InMessage>>,
    machines_up: AtomicUsize,
    connections_closed: AtomicUsize,
}

impl Harness {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            route_call_func: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            machines_up: AtomicUsize::new(0),
            connections_closed: AtomicUsize::new(0),
        })
    }

    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn inbox_count(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }
}

impl SessionLayer for Harness {
    fn get_response_session(&self, _header: &MsgHeader) -> Option<SessionRoute> {
        Some(SessionRoute {
            user_data: 7,
            call_func: self.route_call_func.load(Ordering::Relaxed),
        })
    }

    fn push_in_message(&self, msg: InMessage) {
        self.inbox.lock().unwrap().push(msg);
    }

    fn connection_closed(&self, _machine: &Arc<ClusterMachine>) {}
}

impl MessageHandler for Harness {
    fn deal_message(
        &self,
        session_id: SessionId,
        user_data: u64,
        func_id: i32,
        body: BodyChain,
        _data_len: u32,
    ) {
        self.received
            .lock()
            .unwrap()
            .push((session_id, user_data, func_id, body.to_vec()));
    }
}

impl ClusterEvents for Harness {
    fn machine_up(&self, _machine: &Arc<ClusterMachine>) {
        self.machines_up.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, _machine: &Arc<ClusterMachine>) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

fn start_node(ip: Ipv4Addr, port: u16) -> (Arc<ClusterRuntime>, Arc<Harness>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let harness = Harness::new();
    let config = ClusterConfig::new(ip)
        .with_port(port)
        .with_threads(2)
        .with_connections_per_machine(2)
        .with_ping(50_000_000, 1_000_000_000, 3) // 50ms interval, 1s threshold
        .with_read_buffer_size(64 * 1024);

    let runtime = ClusterRuntime::start(
        config,
        harness.clone(),
        harness.clone(),
        harness.clone(),
    )
    .expect("runtime start");
    (runtime, harness)
}

/// spin until `cond` holds or the deadline passes.
fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// bring up a fully-connected pair of nodes.
fn connected_pair(
    port_a: u16,
    port_b: u16,
) -> (
    Arc<ClusterRuntime>,
    Arc<Harness>,
    Arc<ClusterRuntime>,
    Arc<Harness>,
    Arc<ClusterMachine>,
    Arc<ClusterMachine>,
) {
    let (a, ha) = start_node(NODE_A, port_a);
    let (b, hb) = start_node(NODE_B, port_b);

    let b_from_a = a.add_machine(NODE_B, port_b).unwrap();
    let a_from_b = b.add_machine(NODE_A, port_a).unwrap();

    // one client + one server connection on each side
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.connected_count(&b_from_a) == 2 && b.connected_count(&a_from_b) == 2
        }),
        "fan-out never completed: a={} b={}",
        a.connected_count(&b_from_a),
        b.connected_count(&a_from_b)
    );

    (a, ha, b, hb, b_from_a, a_from_b)
}

#[test]
fn handshake_and_callback_delivery() {
    let (a, _ha, b, hb, b_from_a, _a_from_b) = connected_pair(7801, 7802);

    assert!(hb.machines_up.load(Ordering::Relaxed) >= 1);

    let session = SessionId::new(a.my_ip(), 0, 42);
    a.send_to_machine(
        &b_from_a,
        100,
        session,
        1,
        OutData::Inline(b"hello cluster".to_vec()),
        Priority::Mid,
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || hb.received_count() >= 1),
        "message never delivered"
    );

    let received = hb.received.lock().unwrap();
    let (session_id, user_data, func_id, body) = &received[0];
    assert_eq!(session_id.ip, a.my_ip());
    assert_eq!(session_id.seq, 42);
    assert_eq!(*user_data, 7);
    assert_eq!(*func_id, 100);
    assert_eq!(body, b"hello cluster");
    drop(received);

    let stats = b.stats();
    assert!(stats.recv_msg_count >= 1);
    assert!(stats.recv_bytes >= 32);

    a.shutdown();
    b.shutdown();
}

#[test]
fn inbox_routing() {
    let (a, _ha, b, hb, b_from_a, _a_from_b) = connected_pair(7811, 7812);

    hb.route_call_func.store(false, Ordering::Relaxed);

    let session = SessionId::new(a.my_ip(), 0, 9);
    a.send_to_machine(
        &b_from_a,
        101,
        session,
        2,
        OutData::Inline(b"queued".to_vec()),
        Priority::High,
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || hb.inbox_count() >= 1),
        "inbox never filled"
    );

    let inbox = hb.inbox.lock().unwrap();
    assert_eq!(inbox[0].func_id, 101);
    assert_eq!(inbox[0].data_len, 6);
    assert_eq!(inbox[0].body.to_vec(), b"queued");
    drop(inbox);

    assert_eq!(hb.received_count(), 0);
    assert!(b.stats().enqueue_in_msg_count >= 1);

    b.record_inbox_dequeue(1, 6);
    assert!(b.stats().dequeue_in_msg_count >= 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn ping_round_trip() {
    let (a, _ha, b, _hb, _b_from_a, _a_from_b) = connected_pair(7821, 7822);

    // 50ms send interval: a couple of rounds complete well within this
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.stats().ping_success_count >= 1 && b.stats().ping_success_count >= 1
        }),
        "pings never completed: a={:?} b={:?}",
        a.stats().ping_success_count,
        b.stats().ping_success_count
    );

    let stats = a.stats();
    assert!(stats.ping_total_count >= stats.ping_success_count);
    assert!(stats.ping_time_used > 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn payload_spanning_receive_buffers() {
    // 150KB payload against 64KB receive buffers: the body arrives as
    // multiple blocks that concatenate back to the original bytes
    let (a, _ha, b, hb, b_from_a, _a_from_b) = connected_pair(7831, 7832);

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let mut chain = BlockChain::new();
    chain.push(Bytes::copy_from_slice(&payload[..100_000]));
    chain.push(Bytes::copy_from_slice(&payload[100_000..]));

    let session = SessionId::new(a.my_ip(), 0, 5);
    a.send_to_machine(
        &b_from_a,
        102,
        session,
        3,
        OutData::Blocks(chain),
        Priority::Low,
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || hb.received_count() >= 1),
        "large payload never delivered"
    );

    let received = hb.received.lock().unwrap();
    let (_, _, func_id, body) = &received[0];
    assert_eq!(*func_id, 102);
    assert_eq!(body.len(), payload.len());
    assert_eq!(body, &payload);

    a.shutdown();
    b.shutdown();
}

#[test]
fn stale_version_enqueue_rejected() {
    let (a, _ha, b, _hb, b_from_a, _a_from_b) = connected_pair(7841, 7842);

    let (ctx, version) = a.pick_connection(&b_from_a).unwrap();
    let fail_before = a.stats().fail_msg_count;

    // quote a version from before an (imagined) purge
    let err = a
        .send_via(
            &ctx,
            version.wrapping_sub(1),
            103,
            SessionId::new(a.my_ip(), 0, 8),
            4,
            OutData::Inline(b"late".to_vec()),
            Priority::Mid,
        )
        .unwrap_err();

    assert!(matches!(err, TransportError::StaleSession));
    assert_eq!(a.stats().fail_msg_count, fail_before + 1);
    assert!(a.stats().fail_msg_bytes > 0);

    // the current version still works
    a.send_via(
        &ctx,
        version,
        103,
        SessionId::new(a.my_ip(), 0, 8),
        4,
        OutData::Inline(b"on time".to_vec()),
        Priority::Mid,
    )
    .unwrap();

    a.shutdown();
    b.shutdown();
}

#[test]
fn oversized_payload_rejected() {
    let (a, _ha, b, _hb, b_from_a, _a_from_b) = connected_pair(7851, 7852);

    let err = a
        .send_to_machine(
            &b_from_a,
            104,
            SessionId::new(a.my_ip(), 0, 1),
            5,
            OutData::Inline(vec![0u8; (mesh_transport::MAX_MSG_LENGTH + 1) as usize]),
            Priority::Low,
        )
        .unwrap_err();
    assert!(matches!(err, TransportError::PayloadTooLarge { .. }));

    a.shutdown();
    b.shutdown();
}

#[test]
fn reconnect_after_peer_restart() {
    let (a, ha, b, _hb, b_from_a, _a_from_b) = connected_pair(7861, 7862);
    let ups_before = ha.machines_up.load(Ordering::Relaxed);

    // peer goes away; all connections to it close
    b.shutdown();
    drop(b);

    assert!(
        wait_until(Duration::from_secs(10), || {
            a.connected_count(&b_from_a) == 0
        }),
        "connections to the dead peer never closed"
    );
    assert!(ha.connections_closed.load(Ordering::Relaxed) >= 1);

    // peer comes back on the same address; either our backoff retry or
    // its own client half restores connectivity
    let (b2, _hb2) = start_node(NODE_B, 7862);
    let _ = b2.add_machine(NODE_A, 7861).unwrap();

    assert!(
        wait_until(Duration::from_secs(20), || {
            a.connected_count(&b_from_a) >= 1
        }),
        "never reconnected to the restarted peer"
    );
    assert!(ha.machines_up.load(Ordering::Relaxed) > ups_before);

    a.shutdown();
    b2.shutdown();
}
