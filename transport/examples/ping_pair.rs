//! minimal two-node demo.
//!
//! run one node per terminal (the loopback addresses keep the peers
//! distinguishable on one host):
//!
//! ```text
//! cargo run --example ping_pair -- 127.0.0.1 9101 127.0.0.2 9102
//! cargo run --example ping_pair -- 127.0.0.2 9102 127.0.0.1 9101
//! ```

use mesh_transport::{
    BodyChain, ClusterConfig, ClusterEvents, ClusterMachine, ClusterRuntime, InMessage,
    MessageHandler, MsgHeader, OutData, Priority, SessionId, SessionLayer, SessionRoute,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

struct Demo;

impl SessionLayer for Demo {
    fn get_response_session(&self, _header: &MsgHeader) -> Option<SessionRoute> {
        Some(SessionRoute {
            user_data: 0,
            call_func: true,
        })
    }

    fn push_in_message(&self, _msg: InMessage) {}

    fn connection_closed(&self, machine: &Arc<ClusterMachine>) {
        println!("sessions on {} invalidated", machine.hostname);
    }
}

impl MessageHandler for Demo {
    fn deal_message(
        &self,
        session_id: SessionId,
        _user_data: u64,
        func_id: i32,
        body: BodyChain,
        _data_len: u32,
    ) {
        println!(
            "received func {} ({} bytes) from node {}",
            func_id,
            body.data_len(),
            Ipv4Addr::from(session_id.ip)
        );
    }
}

impl ClusterEvents for Demo {
    fn machine_up(&self, machine: &Arc<ClusterMachine>) {
        println!("machine up: {}", machine.label());
    }

    fn connection_closed(&self, machine: &Arc<ClusterMachine>) {
        println!("connection closed: {}", machine.label());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: {} <my_ip> <my_port> <peer_ip> <peer_port>", args[0]);
        std::process::exit(1);
    }

    let my_ip: Ipv4Addr = args[1].parse()?;
    let my_port: u16 = args[2].parse()?;
    let peer_ip: Ipv4Addr = args[3].parse()?;
    let peer_port: u16 = args[4].parse()?;

    let demo = Arc::new(Demo);
    let config = ClusterConfig::new(my_ip)
        .with_port(my_port)
        .with_threads(2)
        .with_connections_per_machine(2);

    let cluster = ClusterRuntime::start(config, demo.clone(), demo.clone(), demo)?;
    let peer = cluster.add_machine(peer_ip, peer_port)?;

    println!("node {} up, dialing {}", my_ip, peer.label());

    let mut seq = 0u32;
    loop {
        std::thread::sleep(Duration::from_secs(2));

        let session = SessionId::new(cluster.my_ip(), 0, seq);
        let payload = format!("hello #{} from {}", seq, my_ip);
        match cluster.send_to_machine(
            &peer,
            100,
            session,
            seq,
            OutData::Inline(payload.into_bytes()),
            Priority::Mid,
        ) {
            Ok(()) => seq += 1,
            Err(e) => println!("send failed: {}", e),
        }

        let stats = cluster.stats();
        println!(
            "connections={} sent={} received={} ping_ok={}",
            cluster.connected_count(&peer),
            stats.send_msg_count,
            stats.recv_msg_count,
            stats.ping_success_count
        );
    }
}
