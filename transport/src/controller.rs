//! connection establishment and lifecycle control.
//!
//! a single thread owns every not-yet-active socket: it runs the
//! connect/handshake state machine for outbound connections, accepts and
//! validates inbound ones, reaps establishment timeouts, paces
//! reconnection backoff, and once per second aggregates worker stats and
//! feeds the pacing governor. all cross-thread requests arrive over the
//! command channel, so the controller's own state needs no locking.

use crate::config::ClusterConfig;
use crate::error::{Result, TransportError};
use crate::machine::{ClusterMachine, ConnectType, SocketContext};
use crate::pacing;
use crate::protocol::{
    negotiate_version, HelloMessage, MsgHeader, SessionId, CLUSTER_MINOR_VERSION,
    FUNC_ID_HELLO_REQUEST, FUNC_ID_HELLO_RESPONSE, HELLO_LENGTH, MSG_HEADER_LENGTH,
    NO_SESSION_MSG_SEQ,
};
use crate::queue::clear_send_queue;
use crate::runtime::Shared;
use crate::stats::ClusterStats;
use crate::worker::{ActiveSocket, WorkerCmd};
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, SockRef, Socket, Type};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const LISTENER: Token = Token(0);

/// token reserved for the command-channel waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// full handshake exchange: header plus hello payload.
const HANDSHAKE_LEN: usize = MSG_HEADER_LENGTH + HELLO_LENGTH;

/// establishment contexts reaped per timeout pass.
const MAX_TIMEOUT_PER_PASS: usize = 64;

/// a peer must deliver its hello within this after connecting.
const HELLO_RECV_TIMEOUT_MS: u64 = 1_000;

const RECONNECT_INTERVAL_START_MS: u64 = 100;
const RECONNECT_CAP_LIVE_MS: u64 = 30_000;
const RECONNECT_CAP_DEAD_MS: u64 = 1_000;

/// requests other threads make of the controller.
pub(crate) enum ControllerCmd {
    /// open the client half of the fan-out to a machine.
    Connect(Arc<ClusterMachine>),
    /// a worker closed this client context; schedule reconnection.
    Reconnect(Arc<SocketContext>),
    /// a worker closed this server context; return it to the freelist.
    ReleaseServer(Arc<SocketContext>),
    /// stop reconnecting to a machine and drain its client contexts.
    StopReconnect(Arc<ClusterMachine>),
    /// wake the poll loop for shutdown.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    NotConnect,
    Connecting,
    Connected,
    SendData,
    RecvData,
}

/// transient record driving one establishment; distinct from the
/// long-lived socket context it produces.
struct ConnectContext {
    ctx: Arc<SocketContext>,
    stream: Option<TcpStream>,
    state: ConnectState,
    registered: bool,

    buff: [u8; HANDSHAKE_LEN],
    send_bytes: usize,
    recv_bytes: usize,

    connect_start_ms: u64,
    server_start_ms: u64,
    reconnect_interval_ms: u64,
    connect_count: u32,

    need_reconnect: bool,
    need_check_timeout: bool,
}

impl ConnectContext {
    fn new(ctx: Arc<SocketContext>) -> Self {
        Self {
            ctx,
            stream: None,
            state: ConnectState::NotConnect,
            registered: false,
            buff: [0u8; HANDSHAKE_LEN],
            send_bytes: 0,
            recv_bytes: 0,
            connect_start_ms: 0,
            server_start_ms: 0,
            reconnect_interval_ms: RECONNECT_INTERVAL_START_MS,
            connect_count: 0,
            need_reconnect: false,
            need_check_timeout: false,
        }
    }
}

/// outcome of stepping the handshake state machine once.
enum HandlerStep {
    /// blocked; wait for this readiness.
    Want(Interest),
    /// handshake complete, socket ready for handoff.
    Complete,
    /// failed.
    Failed,
}

pub(crate) struct Controller {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    cmd_rx: Receiver<ControllerCmd>,
    worker_txs: Vec<Sender<WorkerCmd>>,

    pool: Vec<Option<ConnectContext>>,
    free_slots: Vec<usize>,

    last_stat_secs: u64,
    last_send_bytes: u64,
}

impl Controller {
    pub(crate) fn new(
        shared: Arc<Shared>,
        poll: Poll,
        mut listener: TcpListener,
        cmd_rx: Receiver<ControllerCmd>,
        worker_txs: Vec<Sender<WorkerCmd>>,
    ) -> std::io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            shared,
            poll,
            events: Events::with_capacity(256),
            listener,
            cmd_rx,
            worker_txs,
            pool: Vec::new(),
            free_slots: Vec::new(),
            last_stat_secs: crate::epoch_secs(),
            last_send_bytes: 0,
        })
    }

    pub(crate) fn run(mut self) {
        log::info!("cluster connection controller started");

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.stats_tick();
            self.drain_commands();
            self.do_reconnect();

            let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_secs(1))) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    log::error!("controller poll failed: {}", e);
                }
                self.events = events;
                continue;
            }

            if events.is_empty() {
                // poll timed out: reap stuck establishments
                self.close_timeout_connections();
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    // a command arrived; the next loop pass drains it
                    continue;
                }
                if event.token() == LISTENER {
                    self.accept_loop();
                    continue;
                }

                let slot = event.token().0 - 1;
                if self.pool.get(slot).map(|c| c.is_none()).unwrap_or(true) {
                    continue;
                }

                if event.is_error() {
                    let conn = self.pool[slot].as_ref().unwrap();
                    log::debug!(
                        "connect {} {} failed, connection closed",
                        if conn.ctx.connect_type == ConnectType::Server {
                            "from"
                        } else {
                            "to"
                        },
                        conn.ctx.peer_label()
                    );
                    self.release_connection(slot);
                    continue;
                }

                self.connection_handler(slot);
            }
            self.events = events;
        }

        log::info!("cluster connection controller stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                ControllerCmd::Connect(machine) => self.machine_make_connections(&machine),
                ControllerCmd::Reconnect(ctx) => self.make_connection(ctx),
                ControllerCmd::ReleaseServer(ctx) => {
                    let mut table = self.shared.table.lock().unwrap();
                    table.free_context(&ctx);
                }
                ControllerCmd::StopReconnect(machine) => self.stop_reconnect(&machine),
                ControllerCmd::Shutdown => {}
            }
        }
    }

    /// open our half of the fan-out to a freshly added machine.
    fn machine_make_connections(&mut self, machine: &Arc<ClusterMachine>) {
        let half = self.shared.config.half_connections();
        for _ in 0..half {
            let ctx = {
                let mut table = self.shared.table.lock().unwrap();
                table.alloc_client_context(machine.ip)
            };
            match ctx {
                Some(ctx) => self.make_connection(ctx),
                None => {
                    log::debug!("no free client context for {}", machine.label());
                    return;
                }
            }
        }
    }

    /// start (or restart) establishment for one client context.
    fn make_connection(&mut self, ctx: Arc<SocketContext>) {
        let slot = self.alloc_slot();
        let mut conn = ConnectContext::new(ctx);
        conn.need_reconnect = true;
        self.pool[slot] = Some(conn);
        self.do_connect(slot);
    }

    fn alloc_slot(&mut self) -> usize {
        match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.pool.push(None);
                self.pool.len() - 1
            }
        }
    }

    /// issue the non-blocking connect, bound to our cluster identity so
    /// the peer can resolve us by source address.
    fn do_connect(&mut self, slot: usize) {
        let config = self.shared.config.clone();
        let conn = self.pool[slot].as_mut().unwrap();
        let machine = conn.ctx.machine().cloned();

        conn.connect_count += 1;
        conn.state = ConnectState::Connecting;
        conn.connect_start_ms = crate::now_ms();
        conn.registered = false;

        let Some(machine) = machine else {
            log::warn!("client context without a machine, dropping");
            self.remove_slot(slot);
            return;
        };

        let stream = match open_client_socket(&config, machine.addr()) {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!("connect to {} failed: {}", machine.label(), e);
                conn.stream = None;
                conn.state = ConnectState::NotConnect;
                return; // retried by the backoff pass
            }
        };

        conn.stream = Some(stream);
        conn.need_check_timeout = true;

        if let Err(e) = self.set_interest(slot, Interest::WRITABLE) {
            log::error!("poll registration for {} failed: {}", machine.label(), e);
            let conn = self.pool[slot].as_mut().unwrap();
            conn.stream = None;
            conn.state = ConnectState::NotConnect;
        }
    }

    fn set_interest(&mut self, slot: usize, interest: Interest) -> std::io::Result<()> {
        let conn = self.pool[slot].as_mut().unwrap();
        let token = Token(slot + 1);
        let stream = conn.stream.as_mut().expect("interest on open stream");
        if conn.registered {
            self.poll.registry().reregister(stream, token, interest)
        } else {
            self.poll.registry().register(stream, token, interest)?;
            conn.registered = true;
            Ok(())
        }
    }

    /// step the establishment state machine until it blocks, completes,
    /// or fails.
    fn connection_handler(&mut self, slot: usize) {
        let step = loop {
            let conn = self.pool[slot].as_mut().unwrap();
            match conn.state {
                ConnectState::Connecting => {
                    // writability reports the connect outcome
                    let stream = conn.stream.as_ref().unwrap();
                    match stream.take_error() {
                        Ok(None) => conn.state = ConnectState::Connected,
                        Ok(Some(e)) => {
                            log::debug!(
                                "connect to {} failed: {}",
                                conn.ctx.peer_label(),
                                e
                            );
                            break HandlerStep::Failed;
                        }
                        Err(e) => {
                            log::debug!(
                                "connect to {} failed: {}",
                                conn.ctx.peer_label(),
                                e
                            );
                            break HandlerStep::Failed;
                        }
                    }
                }
                ConnectState::Connected => match conn.ctx.connect_type {
                    ConnectType::Client => {
                        fill_handshake_buffer(
                            conn,
                            FUNC_ID_HELLO_REQUEST,
                            self.shared.my_ip,
                        );
                        conn.state = ConnectState::SendData;
                    }
                    ConnectType::Server => {
                        conn.state = ConnectState::RecvData;
                        conn.recv_bytes = 0;
                        conn.server_start_ms = crate::now_ms();
                    }
                },
                ConnectState::SendData => match handshake_write(conn) {
                    Ok(true) => {
                        if conn.ctx.connect_type == ConnectType::Client {
                            conn.state = ConnectState::RecvData;
                            conn.recv_bytes = 0;
                            conn.server_start_ms = crate::now_ms();
                        } else {
                            // hello response delivered
                            break HandlerStep::Complete;
                        }
                    }
                    Ok(false) => break HandlerStep::Want(Interest::WRITABLE),
                    Err(_) => break HandlerStep::Failed,
                },
                ConnectState::RecvData => match handshake_read(conn) {
                    Ok(true) => {
                        match self.deal_hello_message(slot) {
                            Ok(()) => {
                                let conn = self.pool[slot].as_mut().unwrap();
                                if conn.ctx.connect_type == ConnectType::Client {
                                    break HandlerStep::Complete;
                                }
                                fill_handshake_buffer(
                                    conn,
                                    FUNC_ID_HELLO_RESPONSE,
                                    self.shared.my_ip,
                                );
                                conn.state = ConnectState::SendData;
                            }
                            Err(_) => break HandlerStep::Failed,
                        }
                    }
                    Ok(false) => break HandlerStep::Want(Interest::READABLE),
                    Err(_) => break HandlerStep::Failed,
                },
                ConnectState::NotConnect => break HandlerStep::Failed,
            }
        };

        match step {
            HandlerStep::Want(interest) => {
                if let Err(e) = self.set_interest(slot, interest) {
                    log::error!("poll control failed: {}", e);
                    self.release_connection(slot);
                }
            }
            HandlerStep::Complete => self.handoff(slot),
            HandlerStep::Failed => self.release_connection(slot),
        }
    }

    /// validate the peer's hello and negotiate the protocol version.
    fn deal_hello_message(&mut self, slot: usize) -> Result<()> {
        let check_magic = self.shared.config.check_magic;
        let conn = self.pool[slot].as_mut().unwrap();

        let header = MsgHeader::decode(&conn.buff[..MSG_HEADER_LENGTH], check_magic)?;
        if header.data_len as usize != HELLO_LENGTH {
            log::error!(
                "hello from {}: message length {} != {}",
                conn.ctx.peer_label(),
                header.data_len,
                HELLO_LENGTH
            );
            return Err(TransportError::BadHello(format!(
                "payload length {}",
                header.data_len
            )));
        }

        let expect_func_id = match conn.ctx.connect_type {
            ConnectType::Client => FUNC_ID_HELLO_RESPONSE,
            ConnectType::Server => FUNC_ID_HELLO_REQUEST,
        };
        if header.func_id != expect_func_id {
            log::error!(
                "hello from {}: invalid function id {} != {}",
                conn.ctx.peer_label(),
                header.func_id,
                expect_func_id
            );
            return Err(TransportError::BadHello(format!(
                "function id {}",
                header.func_id
            )));
        }

        let peer = HelloMessage::decode(&conn.buff[MSG_HEADER_LENGTH..]);
        let ours = HelloMessage::local();
        match negotiate_version(&ours, &peer) {
            Ok((major, minor)) => {
                if major == peer.major && minor != CLUSTER_MINOR_VERSION {
                    log::warn!(
                        "different clustering minor versions ({}, {}) for node {}, continuing",
                        minor,
                        CLUSTER_MINOR_VERSION,
                        conn.ctx.peer_label()
                    );
                }
                if let Some(machine) = conn.ctx.machine() {
                    machine.proto_major.store(major, Ordering::Relaxed);
                    machine.proto_minor.store(minor, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "bad cluster major version range ({}-{}) for node {}, closing connection",
                    peer.min_major,
                    peer.major,
                    conn.ctx.peer_label()
                );
                Err(e)
            }
        }
    }

    /// move a handshaken socket to its owning worker.
    fn handoff(&mut self, slot: usize) {
        let conn = self.pool[slot].as_mut().unwrap();
        if conn.registered {
            let stream = conn.stream.as_mut().unwrap();
            let _ = self.poll.registry().deregister(stream);
        }

        let conn = self.pool[slot].take().unwrap();
        self.free_slots.push(slot);

        let ctx = conn.ctx;
        let stream = conn.stream.expect("handoff with open stream");
        let stats = &self.shared.stats[ctx.worker_index];

        apply_buffer_sizes(&stream, &self.shared.config);

        // any messages a session raced onto the queues while this context
        // was down are stale now; purge bumps the version before the
        // context becomes dispatchable again
        clear_send_queue(&ctx, stats, true);
        ctx.sock_fd.store(stream.as_raw_fd(), Ordering::Release);

        {
            let mut table = self.shared.table.lock().unwrap();
            if let Err(e) = table.add_connected(&ctx) {
                log::error!("recording connection to {} failed: {}", ctx.peer_label(), e);
                ctx.sock_fd.store(-1, Ordering::Release);
                drop(table);
                self.release_context(&ctx);
                return;
            }
        }

        if let Some(machine) = ctx.machine() {
            log::debug!(
                "{} connection {} established",
                ctx.connect_type.tag(),
                machine.label()
            );
            self.shared.events.machine_up(machine);
        }

        let active = ActiveSocket::new(stream, ctx.clone(), self.shared.config.read_buffer_size);
        if self.worker_txs[ctx.worker_index].send(WorkerCmd::Attach(active)).is_err() {
            log::error!("worker {} gone, dropping {}", ctx.worker_index, ctx.peer_label());
            ctx.sock_fd.store(-1, Ordering::Release);
            let mut table = self.shared.table.lock().unwrap();
            table.remove_connected(&ctx);
            drop(table);
            self.release_context(&ctx);
        }
    }

    /// after a failed handoff: recycle the context the way a close would.
    fn release_context(&mut self, ctx: &Arc<SocketContext>) {
        match ctx.connect_type {
            ConnectType::Client => self.make_connection(ctx.clone()),
            ConnectType::Server => {
                let mut table = self.shared.table.lock().unwrap();
                table.free_context(ctx);
            }
        }
    }

    /// drop an in-establishment connection. client contexts stay pooled
    /// with their backoff state for the reconnect pass; server contexts
    /// return to the freelist.
    fn release_connection(&mut self, slot: usize) {
        let conn = self.pool[slot].as_mut().unwrap();

        if conn.registered {
            if let Some(stream) = conn.stream.as_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
            conn.registered = false;
        }
        if conn.stream.take().is_some() {
            log::debug!(
                "close {} connection {}",
                conn.ctx.connect_type.tag(),
                conn.ctx.peer_label()
            );
        }
        conn.state = ConnectState::NotConnect;

        if conn.ctx.connect_type == ConnectType::Server {
            let conn = self.pool[slot].take().unwrap();
            self.free_slots.push(slot);
            let mut table = self.shared.table.lock().unwrap();
            table.free_context(&conn.ctx);
        }
    }

    fn remove_slot(&mut self, slot: usize) {
        if self.pool[slot].take().is_some() {
            self.free_slots.push(slot);
        }
    }

    /// accept until the listener drains.
    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.deal_income_connection(stream, addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn deal_income_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        // rejected sockets are closed by dropping them here
        if let Err(e) = self.admit_income_connection(stream, addr) {
            log::debug!("income connection from {} rejected: {}", addr, e);
        }
    }

    /// admit one inbound socket: the peer must resolve, by source
    /// address, to a machine we know, and have a server-role context to
    /// spare.
    fn admit_income_connection(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY: {}", e);
        }

        let IpAddr::V4(peer_ip) = addr.ip() else {
            return Err(TransportError::UnknownPeer(addr.ip()));
        };

        let ctx = {
            let mut table = self.shared.table.lock().unwrap();
            if table.get_machine(peer_ip).is_none() {
                return Err(TransportError::UnknownPeer(addr.ip()));
            }
            table.alloc_server_context(u32::from(peer_ip))
        };
        let ctx = ctx.ok_or(TransportError::NoFreeContext)?;

        let slot = self.alloc_slot();
        let mut conn = ConnectContext::new(ctx);
        conn.stream = Some(stream);
        conn.state = ConnectState::Connected;
        conn.need_check_timeout = true;
        conn.server_start_ms = crate::now_ms();
        self.pool[slot] = Some(conn);

        self.connection_handler(slot);
        Ok(())
    }

    /// retry closed client contexts whose backoff has elapsed; drain
    /// contexts whose machine stopped reconnecting.
    fn do_reconnect(&mut self) {
        enum Action {
            None,
            Retry,
            Drain,
        }

        let now = crate::now_ms();

        for slot in 0..self.pool.len() {
            let action = {
                let Some(conn) = self.pool[slot].as_mut() else {
                    continue;
                };
                if conn.stream.is_some() || conn.ctx.connect_type == ConnectType::Server {
                    // in progress, or a parked server context
                    Action::None
                } else if !conn.need_reconnect {
                    Action::Drain
                } else if conn.connect_count > 0
                    && now.saturating_sub(conn.connect_start_ms) >= conn.reconnect_interval_ms
                {
                    // double the backoff for the next failure before
                    // launching this attempt
                    conn.reconnect_interval_ms *= 2;
                    let cap = match conn.ctx.machine() {
                        Some(machine) if machine.is_dead() => RECONNECT_CAP_DEAD_MS,
                        _ => RECONNECT_CAP_LIVE_MS,
                    };
                    if conn.reconnect_interval_ms > cap {
                        conn.reconnect_interval_ms = cap;
                    }
                    conn.need_check_timeout = false;
                    Action::Retry
                } else {
                    Action::None
                }
            };

            match action {
                Action::None => {}
                Action::Retry => self.do_connect(slot),
                Action::Drain => {
                    let conn = self.pool[slot].take().unwrap();
                    self.free_slots.push(slot);
                    let mut table = self.shared.table.lock().unwrap();
                    table.free_context(&conn.ctx);
                }
            }
        }
    }

    fn stop_reconnect(&mut self, machine: &Arc<ClusterMachine>) {
        let mut count = 0;
        for conn in self.pool.iter_mut().flatten() {
            if let Some(m) = conn.ctx.machine() {
                if Arc::ptr_eq(m, machine) {
                    conn.need_reconnect = false;
                    count += 1;
                }
            }
        }
        log::debug!(
            "stop reconnect to {}: {} contexts flagged",
            machine.label(),
            count
        );
    }

    /// reap establishments stuck in connect or in hello receive.
    fn close_timeout_connections(&mut self) {
        let now = crate::now_ms();
        let connect_timeout_ms = self.shared.config.connect_timeout_secs * 1_000;

        let mut timed_out = Vec::new();
        for (slot, conn) in self.pool.iter().enumerate() {
            let Some(conn) = conn else { continue };
            if !conn.need_check_timeout || conn.stream.is_none() {
                continue;
            }

            let expired = match conn.state {
                ConnectState::RecvData => {
                    now.saturating_sub(conn.server_start_ms) >= HELLO_RECV_TIMEOUT_MS
                }
                ConnectState::Connecting => {
                    now.saturating_sub(conn.connect_start_ms) >= connect_timeout_ms
                }
                _ => false,
            };

            if expired {
                timed_out.push(slot);
                if timed_out.len() == MAX_TIMEOUT_PER_PASS {
                    break;
                }
            }
        }

        for slot in timed_out {
            let conn = self.pool[slot].as_ref().unwrap();
            log::debug!(
                "close timeout {} connection {}, type: {}",
                if conn.state == ConnectState::RecvData {
                    "recv"
                } else {
                    "connect"
                },
                conn.ctx.peer_label(),
                conn.ctx.connect_type.tag()
            );
            self.release_connection(slot);
        }
    }

    /// once per second: sum worker counters, refresh pacing, log.
    fn stats_tick(&mut self) {
        let now = crate::epoch_secs();
        let elapsed = now.saturating_sub(self.last_stat_secs);
        if elapsed < 1 {
            return;
        }
        self.last_stat_secs = now;

        let mut total = ClusterStats::default();
        for stats in &self.shared.stats {
            stats.sum_into(&mut total);
        }

        let bps = pacing::current_bps(total.send_bytes.saturating_sub(self.last_send_bytes), elapsed);
        self.last_send_bytes = total.send_bytes;

        let params = pacing::recompute(&self.shared.config, bps);
        self.shared.pacing.store(params);

        total.log(params.send_wait_ns / 1_000, params.io_loop_interval_us);
    }
}

/// write the outgoing hello exchange into the connect buffer.
fn fill_handshake_buffer(conn: &mut ConnectContext, func_id: i32, my_ip: u32) {
    let header = MsgHeader::new(
        func_id,
        HELLO_LENGTH as u32,
        SessionId::new(my_ip, crate::epoch_secs() as u32, 0),
        NO_SESSION_MSG_SEQ,
    );
    header.encode_into(&mut conn.buff[..MSG_HEADER_LENGTH]);
    HelloMessage::local().encode_into(&mut conn.buff[MSG_HEADER_LENGTH..]);
    conn.send_bytes = 0;
}

/// push the handshake buffer out; `Ok(true)` once fully written.
fn handshake_write(conn: &mut ConnectContext) -> Result<bool> {
    use std::io::Write;
    let stream = conn.stream.as_mut().unwrap();
    loop {
        match stream.write(&conn.buff[conn.send_bytes..HANDSHAKE_LEN]) {
            Ok(0) => {
                log::debug!("{} connection closed", conn.ctx.peer_label());
                return Err(TransportError::ConnectionReset);
            }
            Ok(n) => {
                conn.send_bytes += n;
                if conn.send_bytes == HANDSHAKE_LEN {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("write to {} failed: {}", conn.ctx.peer_label(), e);
                return Err(TransportError::Io(e));
            }
        }
    }
}

/// pull the peer's handshake in; `Ok(true)` once fully read.
fn handshake_read(conn: &mut ConnectContext) -> Result<bool> {
    use std::io::Read;
    let stream = conn.stream.as_mut().unwrap();
    loop {
        match stream.read(&mut conn.buff[conn.recv_bytes..HANDSHAKE_LEN]) {
            Ok(0) => {
                log::debug!("{} connection closed", conn.ctx.peer_label());
                return Err(TransportError::ConnectionReset);
            }
            Ok(n) => {
                conn.recv_bytes += n;
                if conn.recv_bytes == HANDSHAKE_LEN {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("read from {} failed: {}", conn.ctx.peer_label(), e);
                return Err(TransportError::Io(e));
            }
        }
    }
}

/// non-blocking connect with TCP_NODELAY, bound to our cluster ip.
fn open_client_socket(config: &ClusterConfig, peer: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    // bind the source address so the peer's accept path can identify us
    let local = SocketAddrV4::new(config.my_ip, 0);
    socket.bind(&SocketAddr::V4(local).into())?;

    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(socket.into()))
}

/// apply configured SO_SNDBUF / SO_RCVBUF to a connected socket.
fn apply_buffer_sizes(stream: &TcpStream, config: &ClusterConfig) {
    if config.send_buffer_size == 0 && config.receive_buffer_size == 0 {
        return;
    }

    // safety: the fd is owned by `stream`, which outlives this borrow
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let sock = SockRef::from(&fd);

    if config.send_buffer_size > 0 {
        if let Err(e) = sock.set_send_buffer_size(config.send_buffer_size) {
            log::error!("setsockopt SO_SNDBUF failed: {}", e);
        }
    }
    if config.receive_buffer_size > 0 {
        if let Err(e) = sock.set_recv_buffer_size(config.receive_buffer_size) {
            log::error!("setsockopt SO_RCVBUF failed: {}", e);
        }
    }
}

/// bind the cluster listener with the options inherited by every accepted
/// socket.
pub(crate) fn bind_listener(config: &ClusterConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_linger(None)?;
    socket.set_nodelay(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(config.bind_ip, config.port)).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// spawn the controller thread.
pub(crate) fn spawn_controller(
    shared: Arc<Shared>,
    poll: Poll,
    listener: TcpListener,
    cmd_rx: Receiver<ControllerCmd>,
    worker_txs: Vec<Sender<WorkerCmd>>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let controller = Controller::new(shared, poll, listener, cmd_rx, worker_txs)?;
    std::thread::Builder::new()
        .name("cluster-conn".to_string())
        .spawn(move || controller.run())
}
