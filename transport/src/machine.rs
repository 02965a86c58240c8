//! peer machines and the per-machine socket table.
//!
//! the table is a fixed, open-addressed array indexed by `ip % capacity`
//! with linear probing. each slot owns the per-peer socket contexts: a
//! freelist per connection role plus the currently-connected list that the
//! dispatcher round-robins over. contexts are allocated once at startup
//! and recycled through the freelists for the lifetime of the process.

use crate::error::{Result, TransportError};
use crate::message::PRIORITY_COUNT;
use crate::queue::SendQueue;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// initial capacity of a slot's connected list; growth doubles from here.
const CONNECTED_LIST_INITIAL: usize = 64;

/// a peer node of the mesh.
pub struct ClusterMachine {
    pub ip: u32,
    pub port: u16,
    pub hostname: String,

    /// marked by the membership layer; shortens the reconnect backoff cap
    /// so a recovering peer is picked up quickly.
    pub dead: AtomicBool,

    /// protocol version negotiated with this peer.
    pub proto_major: AtomicU32,
    pub proto_minor: AtomicU32,
}

impl ClusterMachine {
    pub(crate) fn new(ip: u32, port: u16) -> Arc<Self> {
        Arc::new(Self {
            ip,
            port,
            hostname: Ipv4Addr::from(ip).to_string(),
            dead: AtomicBool::new(false),
            proto_major: AtomicU32::new(0),
            proto_minor: AtomicU32::new(0),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port))
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::Relaxed);
    }

    /// `host:port` for log lines.
    pub fn label(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl std::fmt::Debug for ClusterMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMachine")
            .field("addr", &self.label())
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// which side originated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectType {
    Client,
    Server,
}

impl ConnectType {
    /// single-character tag used in log lines.
    pub(crate) fn tag(self) -> char {
        match self {
            ConnectType::Client => 'C',
            ConnectType::Server => 'S',
        }
    }
}

/// the long-lived state of one connection slot to a peer.
///
/// shared between producers (queues, version), the owning worker (socket
/// IO) and the controller (lifecycle). hot per-tick state lives with the
/// worker, not here.
pub struct SocketContext {
    pub(crate) connect_type: ConnectType,

    /// worker that owns this context once it goes active; fixed at startup.
    pub(crate) worker_index: usize,

    machine: OnceLock<Arc<ClusterMachine>>,

    /// raw fd of the connected socket, -1 while closed. producers use it
    /// as the open/closed test under the queue lock.
    pub(crate) sock_fd: AtomicI32,

    /// bumped on every queue purge; enqueues quoting an older version are
    /// rejected so sessions cannot land messages on a recycled socket.
    pub(crate) version: AtomicU32,

    pub(crate) queues: [SendQueue; PRIORITY_COUNT],
}

impl SocketContext {
    fn new(connect_type: ConnectType, worker_index: usize) -> Arc<Self> {
        Arc::new(Self {
            connect_type,
            worker_index,
            machine: OnceLock::new(),
            sock_fd: AtomicI32::new(-1),
            version: AtomicU32::new(0),
            queues: std::array::from_fn(|_| SendQueue::new()),
        })
    }

    pub fn connect_type(&self) -> ConnectType {
        self.connect_type
    }

    /// the enqueue-validation version currently in effect.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.sock_fd.load(Ordering::Acquire) >= 0
    }

    pub fn machine(&self) -> Option<&Arc<ClusterMachine>> {
        self.machine.get()
    }

    /// peer address for log lines.
    pub(crate) fn peer_label(&self) -> String {
        match self.machine.get() {
            Some(m) => m.label(),
            None => "<unbound>".to_string(),
        }
    }

    fn bind_machine(&self, machine: &Arc<ClusterMachine>) {
        let _ = self.machine.set(machine.clone());
    }
}

/// one open-addressed slot of the machine table.
struct MachineSlot {
    /// peer ip, 0 while the slot is unclaimed.
    ip: u32,
    machine: Option<Arc<ClusterMachine>>,

    client_free: Vec<Arc<SocketContext>>,
    server_free: Vec<Arc<SocketContext>>,

    /// contexts currently carrying traffic, in handoff order.
    connected: Vec<Arc<SocketContext>>,

    /// round-robin cursor for dispatch.
    rr_index: AtomicUsize,
}

/// the per-machine socket table.
///
/// all mutation happens under the runtime's table mutex; only the dispatch
/// cursor is atomic (it advances on every outbound send).
pub(crate) struct MachineTable {
    slots: Box<[MachineSlot]>,
}

impl MachineTable {
    /// pre-allocate every slot's socket contexts, spreading ownership
    /// round-robin across the worker pool, server role first, exactly in
    /// slot order. the assignment never changes afterwards.
    pub(crate) fn new(max_machines: usize, half_connections: usize, workers: usize) -> Self {
        let mut worker_cursor = 0usize;
        let slots = (0..max_machines)
            .map(|_| {
                let server_free = (0..half_connections)
                    .map(|_| {
                        let ctx = SocketContext::new(ConnectType::Server, worker_cursor % workers);
                        worker_cursor += 1;
                        ctx
                    })
                    .collect();
                let client_free = (0..half_connections)
                    .map(|_| {
                        let ctx = SocketContext::new(ConnectType::Client, worker_cursor % workers);
                        worker_cursor += 1;
                        ctx
                    })
                    .collect();
                MachineSlot {
                    ip: 0,
                    machine: None,
                    client_free,
                    server_free,
                    connected: Vec::new(),
                    rr_index: AtomicUsize::new(0),
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// linear probe for the slot already claimed by `ip`.
    fn find_index(&self, ip: u32) -> Option<usize> {
        let capacity = self.capacity();
        let home = ip as usize % capacity;
        for probe in 0..=capacity {
            let index = (home + probe) % capacity;
            if self.slots[index].ip == ip {
                return Some(index);
            }
        }
        None
    }

    /// linear probe for an unclaimed slot for `ip`.
    fn alloc_index(&self, ip: u32) -> Option<usize> {
        let capacity = self.capacity();
        let home = ip as usize % capacity;
        for probe in 0..=capacity {
            let index = (home + probe) % capacity;
            if self.slots[index].ip == 0 {
                return Some(index);
            }
        }
        None
    }

    /// claim (or look up) the slot for a peer and return its machine.
    pub(crate) fn add_machine(&mut self, ip: Ipv4Addr, port: u16) -> Result<Arc<ClusterMachine>> {
        let ip = u32::from(ip);
        if let Some(index) = self.find_index(ip) {
            return Ok(self.slots[index].machine.clone().expect("claimed slot has machine"));
        }

        let index = self.alloc_index(ip).ok_or(TransportError::MachineTableFull)?;
        let machine = ClusterMachine::new(ip, port);

        let slot = &mut self.slots[index];
        slot.ip = ip;
        slot.machine = Some(machine.clone());
        for ctx in slot.client_free.iter().chain(slot.server_free.iter()) {
            ctx.bind_machine(&machine);
        }
        slot.connected.reserve(CONNECTED_LIST_INITIAL);

        Ok(machine)
    }

    pub(crate) fn get_machine(&self, ip: Ipv4Addr) -> Option<Arc<ClusterMachine>> {
        self.find_index(u32::from(ip))
            .and_then(|index| self.slots[index].machine.clone())
    }

    /// take a client-role context off the peer's freelist.
    pub(crate) fn alloc_client_context(&mut self, ip: u32) -> Option<Arc<SocketContext>> {
        let index = self.find_index(ip)?;
        self.slots[index].client_free.pop()
    }

    /// take a server-role context off the peer's freelist.
    pub(crate) fn alloc_server_context(&mut self, ip: u32) -> Option<Arc<SocketContext>> {
        let index = self.find_index(ip)?;
        self.slots[index].server_free.pop()
    }

    /// return a context to its role freelist.
    pub(crate) fn free_context(&mut self, ctx: &Arc<SocketContext>) {
        let Some(machine) = ctx.machine() else {
            return;
        };
        let Some(index) = self.find_index(machine.ip) else {
            log::warn!("no table slot for {}", machine.label());
            return;
        };

        let slot = &mut self.slots[index];
        match ctx.connect_type {
            ConnectType::Client => slot.client_free.push(ctx.clone()),
            ConnectType::Server => slot.server_free.push(ctx.clone()),
        }
    }

    /// record a context in its peer's connected list.
    pub(crate) fn add_connected(&mut self, ctx: &Arc<SocketContext>) -> Result<()> {
        let machine = ctx.machine().ok_or(TransportError::NoConnection)?;
        let index = self
            .find_index(machine.ip)
            .ok_or(TransportError::NoConnection)?;

        let slot = &mut self.slots[index];
        if slot.connected.len() == slot.connected.capacity() {
            let grow_to = slot.connected.capacity().max(CONNECTED_LIST_INITIAL / 2) * 2;
            slot.connected.reserve_exact(grow_to - slot.connected.len());
        }
        slot.connected.push(ctx.clone());
        Ok(())
    }

    /// drop a context from its peer's connected list.
    pub(crate) fn remove_connected(&mut self, ctx: &Arc<SocketContext>) -> bool {
        let Some(machine) = ctx.machine() else {
            return false;
        };
        let Some(index) = self.find_index(machine.ip) else {
            return false;
        };

        let connected = &mut self.slots[index].connected;
        match connected.iter().position(|c| Arc::ptr_eq(c, ctx)) {
            Some(position) => {
                connected.remove(position);
                true
            }
            None => false,
        }
    }

    /// round-robin pick of a live connection to `machine`, together with
    /// the context version observed at dispatch time. the caller passes
    /// that version to the enqueue, which rejects it if a purge raced.
    pub(crate) fn pick_connection(
        &self,
        machine: &ClusterMachine,
    ) -> Option<(Arc<SocketContext>, u32)> {
        let index = self.find_index(machine.ip)?;
        let slot = &self.slots[index];
        if slot.connected.is_empty() {
            return None;
        }

        let pick = slot.rr_index.fetch_add(1, Ordering::Relaxed) % slot.connected.len();
        let ctx = slot.connected[pick].clone();
        let version = ctx.version();
        Some((ctx, version))
    }

    /// number of live connections to `machine`.
    pub(crate) fn connected_count(&self, machine: &ClusterMachine) -> usize {
        self.find_index(machine.ip)
            .map(|index| self.slots[index].connected.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MachineTable {
        MachineTable::new(8, 2, 3)
    }

    #[test]
    fn test_add_and_get_machine() {
        let mut table = table();
        let m = table.add_machine(Ipv4Addr::new(10, 0, 0, 1), 9000).unwrap();
        assert_eq!(m.port, 9000);
        assert_eq!(m.hostname, "10.0.0.1");

        let again = table.get_machine(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert!(Arc::ptr_eq(&m, &again));
        assert!(table.get_machine(Ipv4Addr::new(10, 0, 0, 2)).is_none());
    }

    #[test]
    fn test_probing_handles_collisions() {
        let mut table = table();
        // 8 apart: same home slot in an 8-entry table
        let a = Ipv4Addr::from(0x0a00_0001u32);
        let b = Ipv4Addr::from(0x0a00_0009u32);

        let ma = table.add_machine(a, 1).unwrap();
        let mb = table.add_machine(b, 2).unwrap();
        assert!(!Arc::ptr_eq(&ma, &mb));
        assert!(Arc::ptr_eq(&table.get_machine(a).unwrap(), &ma));
        assert!(Arc::ptr_eq(&table.get_machine(b).unwrap(), &mb));
    }

    #[test]
    fn test_table_full() {
        let mut table = MachineTable::new(2, 1, 1);
        table.add_machine(Ipv4Addr::new(10, 0, 0, 1), 1).unwrap();
        table.add_machine(Ipv4Addr::new(10, 0, 0, 2), 1).unwrap();
        assert!(matches!(
            table.add_machine(Ipv4Addr::new(10, 0, 0, 3), 1),
            Err(TransportError::MachineTableFull)
        ));
    }

    #[test]
    fn test_freelists_and_recycle() {
        let mut table = table();
        let m = table.add_machine(Ipv4Addr::new(10, 0, 0, 1), 9000).unwrap();

        let c1 = table.alloc_client_context(m.ip).unwrap();
        let c2 = table.alloc_client_context(m.ip).unwrap();
        assert!(table.alloc_client_context(m.ip).is_none());
        assert_eq!(c1.connect_type(), ConnectType::Client);
        assert!(c1.machine().is_some());

        table.free_context(&c1);
        let c3 = table.alloc_client_context(m.ip).unwrap();
        assert!(Arc::ptr_eq(&c1, &c3));
        drop(c2);

        let s = table.alloc_server_context(m.ip).unwrap();
        assert_eq!(s.connect_type(), ConnectType::Server);
    }

    #[test]
    fn test_worker_assignment_round_robin() {
        let table = MachineTable::new(1, 2, 3);
        let slot = &table.slots[0];
        let owners: Vec<usize> = slot
            .server_free
            .iter()
            .chain(slot.client_free.iter())
            .map(|c| c.worker_index)
            .collect();
        // four contexts, three workers: 0,1,2,0 in allocation order
        assert_eq!(owners.iter().filter(|&&w| w == 0).count(), 2);
        assert_eq!(owners.iter().filter(|&&w| w == 1).count(), 1);
        assert_eq!(owners.iter().filter(|&&w| w == 2).count(), 1);
    }

    #[test]
    fn test_round_robin_pick() {
        let mut table = table();
        let m = table.add_machine(Ipv4Addr::new(10, 0, 0, 1), 9000).unwrap();
        assert!(table.pick_connection(&m).is_none());

        let c1 = table.alloc_client_context(m.ip).unwrap();
        let c2 = table.alloc_client_context(m.ip).unwrap();
        table.add_connected(&c1).unwrap();
        table.add_connected(&c2).unwrap();
        assert_eq!(table.connected_count(&m), 2);

        let picks: Vec<_> = (0..4).map(|_| table.pick_connection(&m).unwrap().0).collect();
        assert!(Arc::ptr_eq(&picks[0], &c1));
        assert!(Arc::ptr_eq(&picks[1], &c2));
        assert!(Arc::ptr_eq(&picks[2], &c1));
        assert!(Arc::ptr_eq(&picks[3], &c2));

        assert!(table.remove_connected(&c1));
        assert!(!table.remove_connected(&c1));
        assert_eq!(table.connected_count(&m), 1);
    }
}
