//! Socket adapters
//! Connect / accept plumbing that hands established sockets to connections

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::EngineError;
use crate::media;

/// Kernel buffer size requested on every data socket
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Read timeout so blocked I/O observes cancellation
pub const IO_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll cadence while waiting to accept
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Map an I/O error to the OS-style status code carried in verdicts
pub fn status_code(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

fn new_socket(addr: &SocketAddr, kind: Type, proto: SockProtocol) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, kind, Some(proto))?;
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    Ok(socket)
}

/// Outgoing connection factory; rotates across targets, binds and local ports
pub struct Connector {
    config: Arc<Config>,
    next_target: AtomicUsize,
    next_bind: AtomicUsize,
    next_port: AtomicUsize,
}

impl Connector {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            next_target: AtomicUsize::new(0),
            next_bind: AtomicUsize::new(0),
            next_port: AtomicUsize::new(0),
        }
    }

    fn pick_target(&self) -> SocketAddr {
        let targets = &self.config.target_addresses;
        let index = self.next_target.fetch_add(1, Ordering::Relaxed) % targets.len();
        targets[index]
    }

    /// Local endpoint for the next connection, if any binding was configured
    fn pick_bind(&self) -> Option<SocketAddr> {
        let config = &self.config;
        let mut addr = if config.bind_addresses.is_empty() {
            None
        } else {
            let index =
                self.next_bind.fetch_add(1, Ordering::Relaxed) % config.bind_addresses.len();
            Some(config.bind_addresses[index])
        };
        if config.local_port_low != 0 {
            let span = if config.local_port_high == 0 {
                1
            } else {
                (config.local_port_high - config.local_port_low + 1) as usize
            };
            let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
            let port = config.local_port_low + offset as u16;
            let base = addr.unwrap_or_else(|| match self.pick_target() {
                SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
                SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
            });
            let mut bound = base;
            bound.set_port(port);
            addr = Some(bound);
        }
        addr
    }

    pub fn connect(&self) -> Result<(TcpStream, SocketAddr), EngineError> {
        let target = self.pick_target();
        let socket = new_socket(&target, Type::STREAM, SockProtocol::TCP)?;
        if let Some(bind) = self.pick_bind() {
            socket.set_reuse_address(true)?;
            socket.bind(&bind.into())?;
        }
        socket.connect(&target.into())?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_POLL_INTERVAL))?;
        debug!(%target, "connected");
        Ok((stream, target))
    }

    pub fn udp_connect(&self) -> Result<(UdpSocket, SocketAddr), EngineError> {
        let target = self.pick_target();
        let socket = new_socket(&target, Type::DGRAM, SockProtocol::UDP)?;
        let bind = self.pick_bind().unwrap_or_else(|| match target {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        });
        socket.bind(&bind.into())?;
        socket.connect(&target.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(IO_POLL_INTERVAL))?;
        debug!(%target, "udp socket ready");
        Ok((socket, target))
    }
}

/// Listening sockets for the accept role; pending connections round-robin
/// across all configured listen addresses.
pub struct TcpAcceptor {
    listeners: Vec<TcpListener>,
    next: AtomicUsize,
}

impl TcpAcceptor {
    pub fn bind(config: &Config) -> Result<Self, EngineError> {
        let mut listeners = Vec::with_capacity(config.listen_addresses.len());
        for addr in &config.listen_addresses {
            let socket = new_socket(addr, Type::STREAM, SockProtocol::TCP)?;
            socket.set_reuse_address(true)?;
            socket.bind(&(*addr).into())?;
            socket.listen(1024)?;
            let listener: TcpListener = socket.into();
            listener.set_nonblocking(true)?;
            debug!(%addr, "listening");
            listeners.push(listener);
        }
        Ok(Self {
            listeners,
            next: AtomicUsize::new(0),
        })
    }

    pub fn local_addr(&self, index: usize) -> Option<SocketAddr> {
        self.listeners.get(index).and_then(|l| l.local_addr().ok())
    }

    /// Block until a peer connects or the run is cancelled
    pub fn accept(
        &self,
        cancel: &CancelToken,
    ) -> Result<Option<(TcpStream, SocketAddr)>, EngineError> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        loop {
            for offset in 0..self.listeners.len() {
                let listener = &self.listeners[(start + offset) % self.listeners.len()];
                match listener.accept() {
                    Ok((stream, peer)) => {
                        stream.set_nonblocking(false)?;
                        stream.set_nodelay(true)?;
                        stream.set_read_timeout(Some(IO_POLL_INTERVAL))?;
                        debug!(%peer, "accepted");
                        return Ok(Some((stream, peer)));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }
}

/// UDP accept: a stream session begins when a start request arrives.
///
/// The listening socket is shared with the accepted session (the server
/// replies with `send_to`), so sessions on one socket run sequentially.
pub struct UdpAcceptor {
    socket: Arc<UdpSocket>,
}

impl UdpAcceptor {
    pub fn bind(config: &Config) -> Result<Self, EngineError> {
        // one shared datagram socket on the first listen address
        let addr = config.listen_addresses[0];
        let socket = new_socket(&addr, Type::DGRAM, SockProtocol::UDP)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(IO_POLL_INTERVAL))?;
        debug!(%addr, "udp listening");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Wait for a client's start request; returns the peer address
    pub fn accept(
        &self,
        cancel: &CancelToken,
        max_datagram: usize,
    ) -> Result<Option<(Arc<UdpSocket>, SocketAddr)>, EngineError> {
        let mut buf = vec![0u8; max_datagram.max(media::HEADER_LEN)];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    if let Ok(header) = media::FrameHeader::decode(&buf[..len]) {
                        if header.is_request && header.sequence == 0 {
                            debug!(%peer, "stream session requested");
                            return Ok(Some((self.socket(), peer)));
                        }
                    }
                    // anything else at accept time is noise; keep waiting
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
        }
    }
}
