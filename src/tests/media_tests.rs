//! Datagram stream run over loopback UDP

use std::sync::Arc;
use std::thread;

use crate::broker::Broker;
use crate::cancel::CancelToken;
use crate::config::{Config, IoPattern, MediaConfig, Protocol, Role, StreamCodec};
use crate::run;
use crate::stats::GlobalStats;

use super::free_udp_port;

fn media() -> MediaConfig {
    // 20 fps x 1 s at 160 kbit/s = 20 frames of 1000 bytes
    MediaConfig {
        bits_per_second: 160_000,
        frames_per_second: 20,
        buffer_depth_secs: 1,
        stream_length_secs: 1,
        codec: StreamCodec::NoResends,
    }
}

#[test]
fn datagram_stream_over_loopback() {
    let port = free_udp_port();

    let server = Config {
        role: Role::Listen,
        protocol: Protocol::Udp,
        pattern: IoPattern::DatagramStream,
        listen_addresses: vec![format!("127.0.0.1:{port}").parse().unwrap()],
        server_exit_limit: 1,
        connection_limit: 1,
        media: Some(media()),
        ..Default::default()
    };
    let client = Config {
        role: Role::Connect,
        protocol: Protocol::Udp,
        pattern: IoPattern::DatagramStream,
        target_addresses: vec![format!("127.0.0.1:{port}").parse().unwrap()],
        connection_limit: 1,
        iterations: 1,
        media: Some(media()),
        ..Default::default()
    };

    let server = Arc::new(server.validated().unwrap());
    let server_stats = Arc::new(GlobalStats::new());
    server_stats.start();
    let mut server_broker =
        Broker::new(server, CancelToken::new(), Arc::clone(&server_stats)).unwrap();
    let server_thread = thread::spawn(move || server_broker.run_to_completion());

    let summary = run::run(client, CancelToken::new()).unwrap();
    server_thread.join().unwrap();

    // loopback is lossless: every scheduled frame must classify as received
    assert!(summary.all_succeeded, "datagram client saw loss or errors");
    assert_eq!(summary.snapshot.bytes_recv, 20 * 1000);

    let server_snap = server_stats.snapshot();
    assert_eq!(server_snap.connections_failed, 0);
    assert_eq!(server_snap.bytes_sent, 20 * 1000);
}
