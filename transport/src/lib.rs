//! symmetric mesh cluster transport.
//!
//! peer nodes keep a fixed fan-out of persistent TCP connections per
//! remote machine and multiplex framed messages over them: three send
//! priorities per connection with byte-level writev batching, streaming
//! receive with 8-byte-aligned length-prefixed framing, ping/pong
//! liveness with timeout reaping, version handshake and automatic
//! reconnection with exponential backoff.
//!
//! # architecture
//!
//! one **connection controller** thread owns every not-yet-active socket:
//! it connects, handshakes, accepts, reaps timeouts, and paces
//! reconnection. **IO workers** own disjoint sets of active sockets and
//! drive all reads, writes, and ping liveness; outbound messages are
//! appended to per-connection priority queues from any thread. a
//! once-per-second governor modulates write pacing from observed
//! throughput.
//!
//! # example
//!
//! ```no_run
//! use mesh_transport::{ClusterConfig, ClusterRuntime, OutData, Priority, SessionId};
//! use mesh_transport::{BodyChain, ClusterEvents, ClusterMachine, InMessage};
//! use mesh_transport::{MessageHandler, MsgHeader, SessionLayer, SessionRoute};
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! struct Callbacks;
//!
//! impl SessionLayer for Callbacks {
//!     fn get_response_session(&self, _header: &MsgHeader) -> Option<SessionRoute> {
//!         Some(SessionRoute { user_data: 0, call_func: true })
//!     }
//!     fn push_in_message(&self, _msg: InMessage) {}
//!     fn connection_closed(&self, _machine: &Arc<ClusterMachine>) {}
//! }
//!
//! impl MessageHandler for Callbacks {
//!     fn deal_message(&self, _session: SessionId, _user_data: u64,
//!                     func_id: i32, body: BodyChain, _data_len: u32) {
//!         println!("func {} with {} bytes", func_id, body.data_len());
//!     }
//! }
//!
//! impl ClusterEvents for Callbacks {
//!     fn machine_up(&self, machine: &Arc<ClusterMachine>) {
//!         println!("up: {}", machine.hostname);
//!     }
//!     fn connection_closed(&self, _machine: &Arc<ClusterMachine>) {}
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let callbacks = Arc::new(Callbacks);
//!     let config = ClusterConfig::new(Ipv4Addr::new(10, 0, 0, 1)).with_port(8087);
//!     let cluster = ClusterRuntime::start(
//!         config,
//!         callbacks.clone(),
//!         callbacks.clone(),
//!         callbacks,
//!     )?;
//!
//!     let peer = cluster.add_machine(Ipv4Addr::new(10, 0, 0, 2), 8087)?;
//!     let session = SessionId::new(cluster.my_ip(), 0, 1);
//!     cluster.send_to_machine(&peer, 100, session, 1,
//!         OutData::Inline(b"hello".to_vec()), Priority::Mid)?;
//!     Ok(())
//! }
//! ```

use std::sync::OnceLock;
use std::time::Instant;

/// baseline instant for monotonic timestamps (initialized on first use)
static BASELINE: OnceLock<Instant> = OnceLock::new();

/// monotonic nanoseconds since process baseline.
#[inline(always)]
pub fn monotonic_nanos() -> u64 {
    let baseline = BASELINE.get_or_init(Instant::now);
    baseline.elapsed().as_nanos() as u64
}

/// monotonic milliseconds since process baseline.
#[inline(always)]
pub(crate) fn now_ms() -> u64 {
    monotonic_nanos() / 1_000_000
}

/// wall clock seconds; coarse, used for session timestamps only.
#[inline]
pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub mod buffer;
pub mod config;
mod controller;
pub mod error;
pub mod machine;
pub mod message;
pub mod pacing;
pub mod protocol;
mod queue;
mod read;
mod runtime;
pub mod stats;
pub mod traits;
mod worker;
mod write;

pub use buffer::{BlockChain, BodyBlock, BodyChain};
pub use config::ClusterConfig;
pub use error::{Result, TransportError};
pub use machine::{ClusterMachine, ConnectType, SocketContext};
pub use message::{InMessage, OutData, Priority, PRIORITY_COUNT};
pub use pacing::PacingParams;
pub use protocol::{
    align8, HelloMessage, MsgHeader, SessionId, CLUSTER_MAJOR_VERSION, CLUSTER_MINOR_VERSION,
    FUNC_ID_HELLO_REQUEST, FUNC_ID_HELLO_RESPONSE, FUNC_ID_PING_REQUEST, FUNC_ID_PING_RESPONSE,
    MAGIC_NUMBER, MAX_MSG_LENGTH, MIN_CLUSTER_MAJOR_VERSION, MIN_CLUSTER_MINOR_VERSION,
    MSG_HEADER_LENGTH, NO_SESSION_MSG_SEQ,
};
pub use runtime::ClusterRuntime;
pub use stats::ClusterStats;
pub use traits::{ClusterEvents, MessageHandler, SessionLayer, SessionRoute};

/// prelude for convenient imports
pub mod prelude {
    pub use crate::config::ClusterConfig;
    pub use crate::error::{Result, TransportError};
    pub use crate::message::{OutData, Priority};
    pub use crate::protocol::SessionId;
    pub use crate::runtime::ClusterRuntime;
    pub use crate::traits::{ClusterEvents, MessageHandler, SessionLayer, SessionRoute};
}
