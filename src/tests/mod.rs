//! End-to-end test suite
//! Full client/server runs over loopback sockets

pub mod integration_tests;
pub mod media_tests;

use std::net::{TcpListener, UdpSocket};

/// Reserve a free loopback TCP port (freed immediately; tests rebind it)
pub(crate) fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Reserve a free loopback UDP port
pub(crate) fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
