//! Stream-pattern runs over real loopback connections

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::broker::Broker;
use crate::cancel::CancelToken;
use crate::config::{Config, IoPattern, Role, ValueRange};
use crate::run;
use crate::stats::{GlobalSnapshot, GlobalStats};

use super::free_tcp_port;

const TRANSFER: u64 = 262_144;
const BUFFER: u64 = 65_536;

fn server_config(port: u16, pattern: IoPattern, exit_limit: u64) -> Config {
    Config {
        role: Role::Listen,
        pattern,
        listen_addresses: vec![format!("127.0.0.1:{port}").parse().unwrap()],
        server_exit_limit: exit_limit,
        transfer: ValueRange::fixed(TRANSFER),
        buffer_size: ValueRange::fixed(BUFFER),
        ..Default::default()
    }
}

fn client_config(port: u16, pattern: IoPattern, connections: u32, iterations: u64) -> Config {
    Config {
        role: Role::Connect,
        pattern,
        target_addresses: vec![format!("127.0.0.1:{port}").parse().unwrap()],
        connection_limit: connections,
        iterations,
        transfer: ValueRange::fixed(TRANSFER),
        buffer_size: ValueRange::fixed(BUFFER),
        ..Default::default()
    }
}

/// Run a server broker and a client run against it; both must finish cleanly
fn run_pair(server: Config, client: Config) -> (GlobalSnapshot, GlobalSnapshot) {
    let server = Arc::new(server.validated().unwrap());
    let server_stats = Arc::new(GlobalStats::new());
    server_stats.start();
    // bind happens inside Broker::new, before the client dials out
    let mut server_broker =
        Broker::new(server, CancelToken::new(), Arc::clone(&server_stats)).unwrap();
    let server_thread = thread::spawn(move || server_broker.run_to_completion());

    let summary = run::run(client, CancelToken::new()).unwrap();
    server_thread.join().unwrap();

    assert!(summary.all_succeeded, "client side had failed connections");
    let server_snap = server_stats.snapshot();
    assert_eq!(server_snap.connections_failed, 0, "server side had failures");
    (server_snap, summary.snapshot)
}

#[test]
fn push_moves_transfer_total_one_way() {
    let port = free_tcp_port();
    let (server, client) = run_pair(
        server_config(port, IoPattern::Push, 1),
        client_config(port, IoPattern::Push, 1, 1),
    );
    assert_eq!(client.bytes_sent, TRANSFER);
    assert_eq!(client.bytes_recv, 0);
    assert_eq!(server.bytes_recv, TRANSFER);
    assert_eq!(server.bytes_sent, 0);
    // both peers together account for exactly twice the transfer total
    assert_eq!(
        client.bytes_sent + client.bytes_recv + server.bytes_sent + server.bytes_recv,
        2 * TRANSFER
    );
}

#[test]
fn pull_moves_transfer_total_the_other_way() {
    let port = free_tcp_port();
    let (server, client) = run_pair(
        server_config(port, IoPattern::Pull, 1),
        client_config(port, IoPattern::Pull, 1, 1),
    );
    assert_eq!(client.bytes_recv, TRANSFER);
    assert_eq!(server.bytes_sent, TRANSFER);
}

#[test]
fn push_pull_moves_transfer_in_both_directions() {
    let port = free_tcp_port();
    let mut server = server_config(port, IoPattern::PushPull, 1);
    server.push_bytes = 32_768;
    server.pull_bytes = 32_768;
    let mut client = client_config(port, IoPattern::PushPull, 1, 1);
    client.push_bytes = 32_768;
    client.pull_bytes = 32_768;

    let (server, client) = run_pair(server, client);
    assert_eq!(client.bytes_sent, TRANSFER);
    assert_eq!(client.bytes_recv, TRANSFER);
    assert_eq!(server.bytes_sent, TRANSFER);
    assert_eq!(server.bytes_recv, TRANSFER);
}

#[test]
fn push_pull_with_unequal_phase_sizes_completes() {
    let port = free_tcp_port();
    // push and pull phases of different sizes across several cycles
    let mut server = server_config(port, IoPattern::PushPull, 1);
    server.push_bytes = 16_384;
    server.pull_bytes = 49_152;
    let mut client = client_config(port, IoPattern::PushPull, 1, 1);
    client.push_bytes = 16_384;
    client.pull_bytes = 49_152;

    let (server, client) = run_pair(server, client);
    assert_eq!(client.bytes_sent, TRANSFER);
    assert_eq!(client.bytes_recv, TRANSFER);
    assert_eq!(server.bytes_sent, TRANSFER);
    assert_eq!(server.bytes_recv, TRANSFER);
}

#[test]
fn duplex_moves_transfer_concurrently() {
    let port = free_tcp_port();
    let mut server = server_config(port, IoPattern::Duplex, 1);
    server.pre_post_recvs = 2;
    let mut client = client_config(port, IoPattern::Duplex, 1, 1);
    client.pre_post_recvs = 2;

    let (server, client) = run_pair(server, client);
    assert_eq!(client.bytes_sent, TRANSFER);
    assert_eq!(client.bytes_recv, TRANSFER);
    assert_eq!(server.bytes_sent, TRANSFER);
    assert_eq!(server.bytes_recv, TRANSFER);
}

#[test]
fn zero_transfer_completes_immediately() {
    let port = free_tcp_port();
    let mut server = server_config(port, IoPattern::Push, 1);
    server.transfer = ValueRange::fixed(0);
    let mut client = client_config(port, IoPattern::Push, 1, 1);
    client.transfer = ValueRange::fixed(0);

    let (server, client) = run_pair(server, client);
    assert_eq!(client.bytes_sent, 0);
    assert_eq!(server.bytes_recv, 0);
}

#[test]
fn rate_limited_push_still_completes() {
    let port = free_tcp_port();
    let mut server = server_config(port, IoPattern::Push, 1);
    server.transfer = ValueRange::fixed(200_000);
    let mut client = client_config(port, IoPattern::Push, 1, 1);
    // the whole transfer needs a couple of 100 ms slices at 1 MB/s
    client.transfer = ValueRange::fixed(200_000);
    client.rate_limit = Some(ValueRange::fixed(1_000_000));

    let server = Arc::new(server.validated().unwrap());
    let server_stats = Arc::new(GlobalStats::new());
    server_stats.start();
    let mut server_broker =
        Broker::new(server, CancelToken::new(), Arc::clone(&server_stats)).unwrap();
    let server_thread = thread::spawn(move || server_broker.run_to_completion());

    let summary = run::run(client, CancelToken::new()).unwrap();
    server_thread.join().unwrap();

    assert!(summary.all_succeeded);
    assert_eq!(summary.snapshot.bytes_sent, 200_000);
    assert!(summary.snapshot.duration >= Duration::from_millis(100));
}

#[test]
fn time_limit_fails_a_stalled_connection() {
    let port = free_tcp_port();
    // a bare listener that accepts and then never sends a byte
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let hold = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(2500));
        drop(socket);
    });

    let mut client = client_config(port, IoPattern::Pull, 1, 1);
    client.time_limit = Some(Duration::from_secs(1));

    let summary = run::run(client, CancelToken::new()).unwrap();
    assert!(!summary.all_succeeded);
    assert_eq!(summary.snapshot.connections_failed, 1);
    hold.join().unwrap();
}
