use std::net::Ipv4Addr;

/// configuration for the cluster transport.
///
/// times are given in the units the IO loops consume them in: nanoseconds
/// for ping pacing, microseconds for write-wait and loop-interval bounds.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// this node's cluster IP; used as the session identity and as the
    /// source address of outbound connections.
    pub my_ip: Ipv4Addr,

    /// address to bind the cluster listener to.
    pub bind_ip: Ipv4Addr,

    /// TCP port the cluster listens on.
    pub port: u16,

    /// number of IO worker threads.
    pub threads: usize,

    /// TCP connections per remote machine. must be even; half are
    /// originated locally, half accepted from the peer.
    pub connections_per_machine: usize,

    /// connect establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// interval between pings on an idle-write connection, in nanoseconds.
    /// 0 disables pings.
    pub ping_send_interval_ns: u64,

    /// ping round-trip above this is counted as one failure, in nanoseconds.
    pub ping_latency_threshold_ns: u64,

    /// consecutive ping failures before the connection is closed.
    pub ping_retries: u32,

    /// write scheduling wait bounds in microseconds; the governor
    /// interpolates between them from observed throughput.
    pub send_min_wait_us: u64,
    pub send_max_wait_us: u64,

    /// worker loop tick bounds in microseconds.
    pub min_loop_interval_us: u64,
    pub max_loop_interval_us: u64,

    /// flow control band in bits per second. max of 0 disables the governor
    /// (pacing stays at the minima).
    pub flow_ctrl_min_bps: u64,
    pub flow_ctrl_max_bps: u64,

    /// socket SO_SNDBUF / SO_RCVBUF; 0 keeps the kernel default.
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,

    /// size of each streaming receive buffer.
    pub read_buffer_size: usize,

    /// capacity of the machine table (open-addressed, keyed by ip).
    pub max_machine_count: usize,

    /// validate the magic number on every received frame.
    pub check_magic: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            my_ip: Ipv4Addr::LOCALHOST,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: 8087,
            threads: 2,
            connections_per_machine: 4,
            connect_timeout_secs: 10,
            ping_send_interval_ns: 1_000_000_000, // 1s
            ping_latency_threshold_ns: 200_000_000, // 200ms
            ping_retries: 3,
            send_min_wait_us: 1_000,
            send_max_wait_us: 5_000,
            min_loop_interval_us: 0,
            max_loop_interval_us: 1_000,
            flow_ctrl_min_bps: 0,
            flow_ctrl_max_bps: 0,
            send_buffer_size: 0,
            receive_buffer_size: 0,
            read_buffer_size: 2 * 1024 * 1024, // 2MB
            max_machine_count: 128,
            check_magic: true,
        }
    }
}

impl ClusterConfig {
    pub fn new(my_ip: Ipv4Addr) -> Self {
        Self {
            my_ip,
            ..Self::default()
        }
    }

    /// set listener bind address.
    pub fn with_bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// set cluster port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// set IO worker thread count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// set connections per remote machine. must be even.
    pub fn with_connections_per_machine(mut self, count: usize) -> Self {
        assert!(
            count >= 2 && count % 2 == 0,
            "connections per machine must be even, got {}",
            count
        );
        self.connections_per_machine = count;
        self
    }

    /// set ping pacing: send interval and latency threshold (nanoseconds),
    /// and the consecutive-failure budget.
    pub fn with_ping(mut self, interval_ns: u64, threshold_ns: u64, retries: u32) -> Self {
        self.ping_send_interval_ns = interval_ns;
        self.ping_latency_threshold_ns = threshold_ns;
        self.ping_retries = retries;
        self
    }

    /// set connect establishment timeout.
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// set the flow control band in bits per second.
    pub fn with_flow_ctrl_bps(mut self, min_bps: u64, max_bps: u64) -> Self {
        self.flow_ctrl_min_bps = min_bps;
        self.flow_ctrl_max_bps = max_bps;
        self
    }

    /// set the streaming receive buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// set machine table capacity.
    pub fn with_max_machine_count(mut self, count: usize) -> Self {
        self.max_machine_count = count;
        self
    }

    /// set TCP buffer sizes.
    pub fn with_tcp_buffer_sizes(mut self, send: usize, recv: usize) -> Self {
        self.send_buffer_size = send;
        self.receive_buffer_size = recv;
        self
    }

    /// enable or disable per-frame magic validation.
    pub fn with_check_magic(mut self, check: bool) -> Self {
        self.check_magic = check;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("thread count must be greater than 0".to_string());
        }

        if self.connections_per_machine < 2 || self.connections_per_machine % 2 != 0 {
            return Err(format!(
                "connections per machine must be even and >= 2, got {}",
                self.connections_per_machine
            ));
        }

        if self.max_machine_count < 2 {
            return Err(format!(
                "machine table needs room for this node and at least one peer, got {}",
                self.max_machine_count
            ));
        }

        if self.read_buffer_size < 64 * 1024 {
            return Err(format!(
                "read buffer must be at least 64KB, got {}",
                self.read_buffer_size
            ));
        }

        if self.send_min_wait_us > self.send_max_wait_us {
            return Err("send wait: min exceeds max".to_string());
        }

        if self.min_loop_interval_us > self.max_loop_interval_us {
            return Err("loop interval: min exceeds max".to_string());
        }

        if self.flow_ctrl_max_bps > 0 && self.flow_ctrl_min_bps > self.flow_ctrl_max_bps {
            return Err("flow control: min bps exceeds max bps".to_string());
        }

        Ok(())
    }

    /// connections originated locally per machine (the other half is accepted).
    pub(crate) fn half_connections(&self) -> usize {
        self.connections_per_machine / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8087);
        assert_eq!(config.connections_per_machine % 2, 0);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClusterConfig::new(Ipv4Addr::new(10, 0, 0, 1))
            .with_port(9100)
            .with_threads(4)
            .with_connections_per_machine(6);

        assert_eq!(config.port, 9100);
        assert_eq!(config.threads, 4);
        assert_eq!(config.half_connections(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "connections per machine must be even")]
    fn test_odd_connections() {
        ClusterConfig::default().with_connections_per_machine(3);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = ClusterConfig::default();
        config.send_min_wait_us = 10_000;
        config.send_max_wait_us = 100;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.read_buffer_size = 1024;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.threads = 0;
        assert!(config.validate().is_err());
    }
}
