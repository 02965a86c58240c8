//! throughput governor.
//!
//! once per second the controller compares observed send throughput with
//! the configured flow-control band and interpolates two globals between
//! their configured bounds: how long a worker waits between write passes
//! on one socket, and how long the worker loop sleeps between ticks.
//! workers read the pair lock-free on every scheduling decision; stale or
//! torn-then-retried values are acceptable by design.

use crate::config::ClusterConfig;
use mesh_sync::SeqLock;

/// the two pacing globals, published together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingParams {
    /// delay before revisiting a socket after a write pass, in nanoseconds.
    pub send_wait_ns: u64,
    /// worker inter-tick sleep target, in microseconds.
    pub io_loop_interval_us: u64,
}

impl PacingParams {
    fn minima(config: &ClusterConfig) -> Self {
        Self {
            send_wait_ns: config.send_min_wait_us * 1_000,
            io_loop_interval_us: config.min_loop_interval_us,
        }
    }
}

/// single-writer cell holding the current [`PacingParams`].
pub struct PacingCell {
    cell: SeqLock<PacingParams>,
}

impl PacingCell {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            cell: SeqLock::new(PacingParams::minima(config)),
        }
    }

    #[inline]
    pub fn read(&self) -> PacingParams {
        self.cell.read()
    }

    /// publish a new pair. single writer: the controller thread.
    pub(crate) fn store(&self, params: PacingParams) {
        self.cell.write(params);
    }
}

/// recompute the pacing pair from one second's worth of send accounting.
///
/// `bps` is the observed outbound rate. with no configured ceiling, or
/// below the lower band edge, both values snap to their minima; otherwise
/// they scale linearly with the busy ratio, clamped at the maxima.
pub(crate) fn recompute(config: &ClusterConfig, bps: u64) -> PacingParams {
    if config.flow_ctrl_max_bps == 0 || bps < config.flow_ctrl_min_bps {
        return PacingParams::minima(config);
    }

    let mut ratio = bps as f64 / config.flow_ctrl_max_bps as f64;
    if ratio > 1.0 {
        ratio = 1.0;
    }

    let wait_us = config.send_min_wait_us as f64
        + (config.send_max_wait_us - config.send_min_wait_us) as f64 * ratio;
    let interval_us = config.min_loop_interval_us as f64
        + (config.max_loop_interval_us - config.min_loop_interval_us) as f64 * ratio;

    PacingParams {
        send_wait_ns: wait_us as u64 * 1_000,
        io_loop_interval_us: interval_us as u64,
    }
}

/// observed outbound rate in bits per second.
#[inline]
pub(crate) fn current_bps(sent_bytes_delta: u64, elapsed_secs: u64) -> u64 {
    if elapsed_secs == 0 {
        return 0;
    }
    8 * sent_bytes_delta / elapsed_secs
}
