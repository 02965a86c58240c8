//! IO worker threads.
//!
//! each worker owns a disjoint set of active sockets and drives them with
//! one poller: a tick schedules timed writes (injecting pings), polls for
//! read readiness, drains readable sockets through the reassembler, and
//! optionally sleeps out the remainder of the pacing interval. sockets
//! arrive over the attach channel once the controller finishes the
//! handshake and leave through the close path, which hands client-role
//! contexts back to the controller for reconnection.

use crate::controller::ControllerCmd;
use crate::error::Drive;
use crate::machine::{ConnectType, SocketContext};
use crate::message::Priority;
use crate::protocol::{SessionId, FUNC_ID_PING_REQUEST};
use crate::queue::{clear_send_queue, insert_into_send_queue_head};
use crate::read::{deal_read_event, ping_message, ReadState};
use crate::runtime::Shared;
use crate::stats::{stat_add, SocketStats};
use crate::write::deal_write_event;
use crossbeam_channel::Receiver;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// sockets closed per scheduling pass is bounded to keep passes short.
const MAX_FAIL_PER_PASS: usize = 32;

/// don't bother sleeping ticks shorter than this, in microseconds.
const MIN_USLEEP_TIME_US: u64 = 100;

/// commands delivered to a worker from the controller.
pub(crate) enum WorkerCmd {
    /// a handshaken socket joins this worker's active set.
    Attach(Box<ActiveSocket>),
}

/// worker-owned hot state of one active connection.
///
/// everything here is touched by exactly one thread (the owning worker);
/// cross-thread state lives on the shared [`SocketContext`].
pub(crate) struct ActiveSocket {
    pub(crate) stream: TcpStream,
    pub(crate) ctx: Arc<SocketContext>,
    pub(crate) reader: ReadState,

    /// priority where the last partial send stopped; writes resume there.
    pub(crate) queue_index: usize,

    pub(crate) next_write_time: u64,
    pub(crate) next_ping_time: u64,

    /// nonzero while a ping awaits its response.
    pub(crate) ping_start_time: u64,
    pub(crate) ping_fail_count: u32,
}

impl ActiveSocket {
    pub(crate) fn new(stream: TcpStream, ctx: Arc<SocketContext>, read_buffer_size: usize) -> Box<Self> {
        Box::new(Self {
            stream,
            ctx,
            reader: ReadState::new(read_buffer_size),
            queue_index: 0,
            next_write_time: 0,
            next_ping_time: 0,
            ping_start_time: 0,
            ping_fail_count: 0,
        })
    }
}

pub(crate) struct Worker {
    index: usize,
    shared: Arc<Shared>,
    stats: Arc<SocketStats>,
    poll: Poll,
    events: Events,
    cmd_rx: Receiver<WorkerCmd>,
    sockets: Vec<Option<Box<ActiveSocket>>>,
    free_slots: Vec<usize>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        cmd_rx: Receiver<WorkerCmd>,
    ) -> std::io::Result<Self> {
        let stats = shared.stats[index].clone();
        Ok(Self {
            index,
            shared,
            stats,
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            cmd_rx,
            sockets: Vec::new(),
            free_slots: Vec::new(),
        })
    }

    pub(crate) fn run(mut self) {
        log::info!("cluster io worker {} started", self.index);

        while !self.shared.shutdown.load(Ordering::Acquire) {
            let loop_start = crate::monotonic_nanos();

            self.drain_commands();
            self.schedule_writes();

            let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            stat_add!(self.stats, epoll_wait_count);
            let wait_start = crate::monotonic_nanos();
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_millis(1))) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    log::error!("worker {} poll failed: {}", self.index, e);
                }
            }
            stat_add!(
                self.stats,
                epoll_wait_time_used,
                crate::monotonic_nanos() - wait_start
            );

            for event in events.iter() {
                let slot = event.token().0;
                if self
                    .sockets
                    .get(slot)
                    .map(|s| s.is_none())
                    .unwrap_or(true)
                {
                    continue;
                }

                if event.is_error() {
                    let sock = self.sockets[slot].as_ref().unwrap();
                    log::debug!(
                        "connection {} {} closed",
                        if sock.ctx.connect_type == ConnectType::Client {
                            "to"
                        } else {
                            "from"
                        },
                        sock.ctx.peer_label()
                    );
                    self.close_socket(slot);
                    continue;
                }

                let mut should_close = false;
                {
                    let shared = self.shared.clone();
                    let stats = self.stats.clone();
                    let sock = self.sockets[slot].as_mut().unwrap();
                    loop {
                        match deal_read_event(sock, &shared, &stats) {
                            Ok(Drive::More) => {}
                            Ok(Drive::Wait) => break,
                            Err(_) => {
                                should_close = true;
                                break;
                            }
                        }
                    }
                }
                if should_close {
                    self.close_socket(slot);
                }
            }
            self.events = events;

            self.tick_sleep(loop_start);
        }

        // drop every socket on the way out; queued messages are released
        // with drop accounting like any close
        let slots: Vec<usize> = (0..self.sockets.len())
            .filter(|&slot| self.sockets[slot].is_some())
            .collect();
        for slot in slots {
            self.close_socket(slot);
        }

        log::info!("cluster io worker {} stopped", self.index);
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                WorkerCmd::Attach(active) => self.attach(active),
            }
        }
    }

    /// install a handshaken socket: fresh pacing cursors, poll
    /// registration, slot in the active set.
    fn attach(&mut self, mut active: Box<ActiveSocket>) {
        let now = crate::monotonic_nanos();
        let pacing = self.shared.pacing.read();

        active.queue_index = 0;
        active.ping_start_time = 0;
        active.ping_fail_count = 0;
        active.next_write_time = now + pacing.send_wait_ns;
        active.next_ping_time = now + self.shared.config.ping_send_interval_ns;

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.sockets.push(None);
                self.sockets.len() - 1
            }
        };

        if let Err(e) =
            self.poll
                .registry()
                .register(&mut active.stream, Token(slot), Interest::READABLE)
        {
            log::error!(
                "worker {} failed to register {}: {}",
                self.index,
                active.ctx.peer_label(),
                e
            );
            self.sockets[slot] = Some(active);
            self.close_socket(slot);
            return;
        }

        log::debug!(
            "worker {} attached {} connection {}",
            self.index,
            active.ctx.connect_type.tag(),
            active.ctx.peer_label()
        );
        self.sockets[slot] = Some(active);
    }

    /// timed write pass over every active socket, with ping liveness
    /// accounting folded in.
    fn schedule_writes(&mut self) {
        let now = crate::monotonic_nanos();
        let pacing = self.shared.pacing.read();
        let config = &self.shared.config;
        let mut fail_slots: Vec<usize> = Vec::new();

        let stats = self.stats.clone();
        for slot in 0..self.sockets.len() {
            let Some(sock) = self.sockets[slot].as_deref_mut() else {
                continue;
            };

            if now < sock.next_write_time {
                continue;
            }

            if sock.ping_start_time > 0 {
                // a ping is in flight; count it failed once overdue
                if now - sock.ping_start_time > config.ping_latency_threshold_ns {
                    sock.ping_start_time = 0;
                    sock.ping_fail_count += 1;
                    if sock.ping_fail_count > config.ping_retries {
                        log::error!(
                            "ping to {} timed out more than {} times, closing",
                            sock.ctx.peer_label(),
                            config.ping_retries
                        );
                        if fail_slots.len() < MAX_FAIL_PER_PASS {
                            fail_slots.push(slot);
                        }
                        continue;
                    }
                    log::warn!(
                        "ping to {} timed out, fail count: {}",
                        sock.ctx.peer_label(),
                        sock.ping_fail_count
                    );
                }
            } else if config.ping_send_interval_ns > 0 && now >= sock.next_ping_time {
                stat_add!(stats, ping_total_count);
                sock.ping_start_time = now;
                sock.next_ping_time = now + config.ping_send_interval_ns;

                // pings carry no session; seq 0, our identity and clock
                let ping = ping_message(
                    FUNC_ID_PING_REQUEST,
                    SessionId::new(self.shared.my_ip, crate::epoch_secs() as u32, 0),
                );
                insert_into_send_queue_head(&sock.ctx, ping, Priority::High, &stats);
            }

            loop {
                match deal_write_event(sock, &stats) {
                    Ok(Drive::More) => {}
                    Ok(Drive::Wait) => {
                        sock.next_write_time = now + pacing.send_wait_ns;
                        break;
                    }
                    Err(_) => {
                        if fail_slots.len() < MAX_FAIL_PER_PASS {
                            fail_slots.push(slot);
                        }
                        break;
                    }
                }
            }
        }

        for slot in fail_slots {
            self.close_socket(slot);
        }
    }

    /// tear one connection down and route its context onward: clients go
    /// back to the controller for reconnection, server contexts return to
    /// their freelist.
    fn close_socket(&mut self, slot: usize) {
        let Some(mut sock) = self.sockets[slot].take() else {
            return;
        };
        self.free_slots.push(slot);

        let _ = self.poll.registry().deregister(&mut sock.stream);
        sock.ctx.sock_fd.store(-1, Ordering::Release);

        {
            let mut table = self.shared.table.lock().unwrap();
            table.remove_connected(&sock.ctx);
        }

        clear_send_queue(&sock.ctx, &self.stats, false);

        if let Some(machine) = sock.ctx.machine() {
            self.shared.session.connection_closed(machine);
            self.shared.events.connection_closed(machine);
        }

        let cmd = match sock.ctx.connect_type {
            ConnectType::Client => ControllerCmd::Reconnect(sock.ctx.clone()),
            ConnectType::Server => ControllerCmd::ReleaseServer(sock.ctx.clone()),
        };
        self.shared.notify_controller(cmd);

        // dropping the socket closes the fd and frees the reassembly state
    }

    /// sleep out the remainder of the pacing tick.
    fn tick_sleep(&self, loop_start: u64) {
        let interval_us = self.shared.pacing.read().io_loop_interval_us;
        if interval_us <= MIN_USLEEP_TIME_US {
            return;
        }

        let elapsed_us = (crate::monotonic_nanos() - loop_start) / 1_000;
        let remain = interval_us as i64 - elapsed_us as i64;
        if remain >= MIN_USLEEP_TIME_US as i64 && remain <= interval_us as i64 {
            stat_add!(self.stats, loop_usleep_count);
            stat_add!(self.stats, loop_usleep_time, remain as u64);
            std::thread::sleep(Duration::from_micros(remain as u64));
        }
    }
}

/// spawn one worker thread.
pub(crate) fn spawn_worker(
    index: usize,
    shared: Arc<Shared>,
    cmd_rx: Receiver<WorkerCmd>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let worker = Worker::new(index, shared, cmd_rx)?;
    std::thread::Builder::new()
        .name(format!("cluster-io-{}", index))
        .spawn(move || worker.run())
}
