use thiserror::Error;

/// errors that can occur in the cluster transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: u32, max: u32 },

    #[error("bad magic number: {got:#010x}")]
    BadMagic { got: u32 },

    #[error("inconsistent header: data_len {data_len} vs aligned {aligned}")]
    BadAlignment { data_len: u32, aligned: u32 },

    #[error("func_id {func_id} requires a single-buffer frame, data length {data_len} too large")]
    OversizedSingleBufferFrame { func_id: i32, data_len: u32 },

    #[error("body continuation not 8-byte aligned at {recv_body_bytes} bytes")]
    UnalignedContinuation { recv_body_bytes: usize },

    #[error("handshake message invalid: {0}")]
    BadHello(String),

    #[error("no compatible protocol major version in peer range {peer_min}-{peer_major}")]
    IncompatibleMajor { peer_min: u32, peer_major: u32 },

    #[error("stale session: socket closed or version changed")]
    StaleSession,

    #[error("peer {0} not in machine list")]
    UnknownPeer(std::net::IpAddr),

    #[error("machine table full")]
    MachineTableFull,

    #[error("no connection available to peer")]
    NoConnection,

    #[error("connection slots exhausted")]
    NoFreeContext,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// outcome of one read or write pass over a socket.
///
/// `More` means the call made progress and should be repeated immediately;
/// `Wait` means the socket is drained (or the kernel pushed back) and the
/// caller should come back on the next readiness event or scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drive {
    More,
    Wait,
}
