//! runtime construction and the public send/membership surface.
//!
//! everything that used to be file-scope global state in transports of
//! this shape (worker contexts, the machine table, pacing values, stats
//! handles, the registered callbacks) lives on one explicitly-constructed
//! [`ClusterRuntime`], threaded through the controller and the workers.

use crate::config::ClusterConfig;
use crate::controller::{bind_listener, spawn_controller, ControllerCmd, WAKER_TOKEN};
use crate::error::{Result, TransportError};
use crate::machine::{ClusterMachine, MachineTable, SocketContext};
use crate::message::{OutData, OutMessage, Priority};
use crate::pacing::{PacingCell, PacingParams};
use crate::protocol::{align8, MsgHeader, SessionId, MAX_MSG_LENGTH};
use crate::queue::push_to_send_queue;
use crate::stats::{stat_add, ClusterStats, SocketStats};
use crate::traits::{ClusterEvents, MessageHandler, SessionLayer};
use crate::worker::spawn_worker;
use crossbeam_channel::{unbounded, Sender};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// state shared by the controller, the workers, and the public API.
pub(crate) struct Shared {
    pub(crate) config: ClusterConfig,
    pub(crate) my_ip: u32,
    pub(crate) table: Mutex<MachineTable>,
    pub(crate) pacing: PacingCell,
    pub(crate) stats: Vec<Arc<SocketStats>>,
    pub(crate) session: Arc<dyn SessionLayer>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) events: Arc<dyn ClusterEvents>,
    pub(crate) controller_tx: Sender<ControllerCmd>,
    controller_waker: mio::Waker,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    /// queue a command for the controller and kick it out of its poll.
    pub(crate) fn notify_controller(&self, cmd: ControllerCmd) {
        if self.controller_tx.send(cmd).is_ok() {
            let _ = self.controller_waker.wake();
        }
    }
}

/// the cluster transport: a listener, one connection controller thread,
/// and a pool of IO workers multiplexing framed messages over persistent
/// TCP connections to every registered machine.
pub struct ClusterRuntime {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ClusterRuntime {
    /// validate the configuration, bind the listener, and start the
    /// controller and worker threads.
    ///
    /// the collaborators are registered once here and invoked from IO
    /// threads for the lifetime of the runtime.
    pub fn start(
        config: ClusterConfig,
        session: Arc<dyn SessionLayer>,
        handler: Arc<dyn MessageHandler>,
        events: Arc<dyn ClusterEvents>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(TransportError::InvalidConfig)?;

        let (controller_tx, controller_rx) = unbounded();
        let mut worker_txs = Vec::with_capacity(config.threads);
        let mut worker_rxs = Vec::with_capacity(config.threads);
        for _ in 0..config.threads {
            let (tx, rx) = unbounded();
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }

        let table = MachineTable::new(
            config.max_machine_count,
            config.half_connections(),
            config.threads,
        );
        let stats = (0..config.threads)
            .map(|_| Arc::new(SocketStats::default()))
            .collect();

        let poll = mio::Poll::new()?;
        let controller_waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            my_ip: u32::from(config.my_ip),
            pacing: PacingCell::new(&config),
            table: Mutex::new(table),
            stats,
            session,
            handler,
            events,
            controller_tx,
            controller_waker,
            shutdown: AtomicBool::new(false),
            config,
        });

        // this node occupies its own table slot, like any peer
        {
            let mut table = shared.table.lock().unwrap();
            table.add_machine(shared.config.my_ip, shared.config.port)?;
        }

        let listener = bind_listener(&shared.config)?;

        let mut handles = Vec::with_capacity(shared.config.threads + 1);
        for (index, rx) in worker_rxs.into_iter().enumerate() {
            handles.push(spawn_worker(index, shared.clone(), rx)?);
        }
        handles.push(spawn_controller(
            shared.clone(),
            poll,
            listener,
            controller_rx,
            worker_txs,
        )?);

        log::info!(
            "cluster transport listening on {}:{} ({} workers, {} connections per machine)",
            shared.config.bind_ip,
            shared.config.port,
            shared.config.threads,
            shared.config.connections_per_machine
        );

        Ok(Arc::new(Self {
            shared,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }))
    }

    /// register a peer and start connecting our half of the fan-out.
    pub fn add_machine(&self, ip: Ipv4Addr, port: u16) -> Result<Arc<ClusterMachine>> {
        let machine = {
            let mut table = self.shared.table.lock().unwrap();
            table.add_machine(ip, port)?
        };

        if u32::from(ip) != self.shared.my_ip {
            self.shared
                .notify_controller(ControllerCmd::Connect(machine.clone()));
        }

        Ok(machine)
    }

    pub fn get_machine(&self, ip: Ipv4Addr) -> Option<Arc<ClusterMachine>> {
        self.shared.table.lock().unwrap().get_machine(ip)
    }

    /// stop reconnecting to a machine; its idle client contexts drain back
    /// to the freelist on the controller's next pass.
    pub fn stop_reconnect(&self, machine: &Arc<ClusterMachine>) {
        self.shared
            .notify_controller(ControllerCmd::StopReconnect(machine.clone()));
    }

    /// round-robin pick of a live connection, paired with the context
    /// version to quote on later sends. sessions that hold a connection
    /// across a request/response exchange pin both halves of this pair.
    pub fn pick_connection(
        &self,
        machine: &ClusterMachine,
    ) -> Option<(Arc<SocketContext>, u32)> {
        self.shared.table.lock().unwrap().pick_connection(machine)
    }

    /// enqueue a message on a specific connection.
    ///
    /// `observed_version` must be the version returned by
    /// [`pick_connection`](Self::pick_connection); if the connection was
    /// purged since, the send fails with `StaleSession` and the payload is
    /// dropped with fail accounting.
    pub fn send_via(
        &self,
        ctx: &Arc<SocketContext>,
        observed_version: u32,
        func_id: i32,
        session_id: SessionId,
        msg_seq: u32,
        data: OutData,
        priority: Priority,
    ) -> Result<()> {
        let data_len = data.len() as u32;
        if align8(data_len) > MAX_MSG_LENGTH {
            return Err(TransportError::PayloadTooLarge {
                len: data_len,
                max: MAX_MSG_LENGTH,
            });
        }

        let header = MsgHeader::new(func_id, data_len, session_id, msg_seq);
        let msg = OutMessage::new(header, data);
        push_to_send_queue(
            ctx,
            msg,
            priority,
            observed_version,
            &self.shared.stats[ctx.worker_index],
        )
    }

    /// dispatch a message to a machine over the next connection in its
    /// round-robin.
    pub fn send_to_machine(
        &self,
        machine: &ClusterMachine,
        func_id: i32,
        session_id: SessionId,
        msg_seq: u32,
        data: OutData,
        priority: Priority,
    ) -> Result<()> {
        let (ctx, version) = self
            .pick_connection(machine)
            .ok_or(TransportError::NoConnection)?;
        self.send_via(&ctx, version, func_id, session_id, msg_seq, data, priority)
    }

    /// live connections to a machine (both roles).
    pub fn connected_count(&self, machine: &ClusterMachine) -> usize {
        self.shared.table.lock().unwrap().connected_count(machine)
    }

    /// sum of all worker counters.
    pub fn stats(&self) -> ClusterStats {
        let mut total = ClusterStats::default();
        for stats in &self.shared.stats {
            stats.sum_into(&mut total);
        }
        total
    }

    /// credit the session layer's inbox consumption; pairs with the
    /// enqueue-side counters the read path advances.
    pub fn record_inbox_dequeue(&self, count: u64, bytes: u64) {
        let stats = &self.shared.stats[0];
        stat_add!(stats, dequeue_in_msg_count, count);
        stat_add!(stats, dequeue_in_msg_bytes, bytes);
    }

    /// the pacing values currently in effect.
    pub fn pacing(&self) -> PacingParams {
        self.shared.pacing.read()
    }

    /// this node's session identity.
    pub fn my_ip(&self) -> u32 {
        self.shared.my_ip
    }

    /// stop all threads and close every connection. idempotent; queued
    /// messages are dropped with the usual close accounting.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("cluster transport shutting down");
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify_controller(ControllerCmd::Shutdown);

        let handles = {
            let mut guard = self.handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
        log::info!("cluster transport stopped");
    }
}

impl Drop for ClusterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
