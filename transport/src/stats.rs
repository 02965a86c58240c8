//! per-worker IO counters and their periodic aggregation.
//!
//! every worker owns one [`SocketStats`]; producers bump the counters of
//! the worker that owns the target socket. all counters are relaxed
//! atomics, summed once per second by the controller thread, which logs
//! the totals and feeds `send_bytes` into the pacing governor. none of
//! this sits on the hot path in a way that needs stronger ordering.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! socket_stats {
    ($($name:ident),+ $(,)?) => {
        /// counters owned by one IO worker.
        #[derive(Default)]
        pub struct SocketStats {
            $(pub $name: AtomicU64,)+
        }

        /// a point-in-time sum of every worker's counters.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct ClusterStats {
            $(pub $name: u64,)+
        }

        impl SocketStats {
            /// accumulate this worker's counters into `acc`.
            pub fn sum_into(&self, acc: &mut ClusterStats) {
                $(acc.$name += self.$name.load(Ordering::Relaxed);)+
            }
        }

        impl ClusterStats {
            /// log the aggregate in `key=value` form. names match the ops
            /// dashboards and must not change.
            pub fn log(&self, send_wait_time_us: u64, io_loop_interval_us: u64) {
                log::info!(
                    concat!(
                        "cluster io:",
                        $(" ", stringify!($name), "={}",)+
                        " send_wait_time={} io_loop_interval={}"
                    ),
                    $(self.$name,)+
                    send_wait_time_us,
                    io_loop_interval_us,
                );
            }
        }
    };
}

socket_stats! {
    send_msg_count,
    drop_msg_count,
    send_bytes,
    drop_bytes,
    recv_msg_count,
    recv_bytes,
    enqueue_in_msg_count,
    enqueue_in_msg_bytes,
    dequeue_in_msg_count,
    dequeue_in_msg_bytes,
    call_writev_count,
    call_read_count,
    send_retry_count,
    epoll_wait_count,
    epoll_wait_time_used,
    loop_usleep_count,
    loop_usleep_time,
    ping_total_count,
    ping_success_count,
    ping_time_used,
    send_delayed_time,
    push_msg_count,
    push_msg_bytes,
    fail_msg_count,
    fail_msg_bytes,
}

/// shorthand for the relaxed increments sprinkled through the IO paths.
macro_rules! stat_add {
    ($stats:expr, $name:ident, $value:expr) => {
        $stats
            .$name
            .fetch_add($value as u64, std::sync::atomic::Ordering::Relaxed)
    };
    ($stats:expr, $name:ident) => {
        stat_add!($stats, $name, 1u64)
    };
}
pub(crate) use stat_add;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_across_workers() {
        let a = SocketStats::default();
        let b = SocketStats::default();

        stat_add!(a, send_msg_count);
        stat_add!(a, send_bytes, 100);
        stat_add!(b, send_bytes, 50);
        stat_add!(b, recv_msg_count);

        let mut total = ClusterStats::default();
        a.sum_into(&mut total);
        b.sum_into(&mut total);

        assert_eq!(total.send_msg_count, 1);
        assert_eq!(total.send_bytes, 150);
        assert_eq!(total.recv_msg_count, 1);
        assert_eq!(total.drop_msg_count, 0);
    }
}
