//! Connection lifecycle
//! Per-connection state machine owning the socket, pattern engine and stats;
//! completions flow back to the serialized driver as messages

use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cancel::{CancelReason, CancelToken};
use crate::config::{Config, OnError, Protocol, Role};
use crate::error::{EngineError, Verdict};
use crate::media::{self, ReceiveStep, SendStep, StreamReceiver, StreamSender};
use crate::pattern::{encode_trailer, Completion, NextStep, StreamPattern, StreamTask};
use crate::payload;
use crate::rate_limiter::PeriodBudget;
use crate::sockets::{status_code, Connector, TcpAcceptor, UdpAcceptor, IO_POLL_INTERVAL};
use crate::stats::{ConnectionStats, DatagramStats, GlobalStats};

/// Lifecycle states in order of progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Creating,
    Connecting,
    Accepting,
    InitiatingIo,
    Io,
    Closing,
    Closed,
}

/// Broker notifications; the connection holds this non-owning handle only
/// for lifecycle callbacks, never to drive the broker's lifetime.
pub trait LifecycleObserver: Send + Sync {
    fn initiating_io(&self);
    fn closing(&self, was_active: bool);
}

/// Everything a connection worker needs, shared by reference
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub observer: Arc<dyn LifecycleObserver>,
    pub connector: Option<Arc<Connector>>,
    pub tcp_acceptor: Option<Arc<TcpAcceptor>>,
    pub udp_acceptor: Option<Arc<UdpAcceptor>>,
    pub global: Arc<GlobalStats>,
    pub cancel: CancelToken,
}

/// One connection record: identity, state, owned counters and final verdict.
/// The broker owns the record through an `Arc` handle and reaps it once closed.
pub struct ConnectionRecord {
    pub id: u64,
    state: Mutex<ConnState>,
    verdict: Mutex<Option<Verdict>>,
    pub stats: Arc<ConnectionStats>,
    pub dgram: Arc<DatagramStats>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl ConnectionRecord {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(ConnState::Creating),
            verdict: Mutex::new(None),
            stats: Arc::new(ConnectionStats::new()),
            dgram: Arc::new(DatagramStats::new()),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    pub fn verdict(&self) -> Option<Verdict> {
        *self.verdict.lock()
    }

    fn set_verdict(&self, verdict: Verdict) {
        let mut slot = self.verdict.lock();
        assert!(slot.is_none(), "connection verdict written twice");
        *slot = Some(verdict);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn addresses(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        (*self.local_addr.lock(), *self.remote_addr.lock())
    }
}

/// Spawn the worker thread driving one connection end to end
pub fn spawn(
    ctx: ConnectionContext,
    record: Arc<ConnectionRecord>,
) -> Result<JoinHandle<()>, EngineError> {
    thread::Builder::new()
        .name(format!("conn-{}", record.id))
        .spawn(move || run_connection(ctx, record))
        .map_err(|e| EngineError::Thread(e.to_string()))
}

/// An established transport endpoint
enum Endpoint {
    Tcp(TcpStream),
    UdpClient(UdpSocket),
    UdpServer(Arc<UdpSocket>, SocketAddr),
}

fn cancel_verdict(cancel: &CancelToken) -> Verdict {
    match cancel.reason() {
        Some(CancelReason::TimeLimit) => Verdict::TimeLimit,
        _ => Verdict::Cancelled,
    }
}

fn run_connection(ctx: ConnectionContext, record: Arc<ConnectionRecord>) {
    record.stats.start();

    let mut was_active = false;
    let verdict = match establish(&ctx, &record) {
        Err(err) => {
            warn!(id = record.id, %err, "socket establishment failed");
            match err {
                EngineError::Socket(ref io) => Verdict::Io(status_code(io)),
                _ => Verdict::Resource,
            }
        }
        Ok(None) => cancel_verdict(&ctx.cancel),
        Ok(Some(endpoint)) => {
            ctx.observer.initiating_io();
            was_active = true;
            record.set_state(ConnState::InitiatingIo);
            match endpoint {
                Endpoint::Tcp(stream) => run_stream(&ctx, &record, stream),
                Endpoint::UdpClient(socket) => run_media_client(&ctx, &record, socket),
                Endpoint::UdpServer(socket, peer) => run_media_server(&ctx, &record, socket, peer),
            }
        }
    };

    record.stats.stop();
    record.set_verdict(verdict);
    record.set_state(ConnState::Closing);

    let (local, remote) = record.addresses();
    let snapshot_note = if ctx.config.protocol == Protocol::Udp {
        let snap = record.dgram.snapshot();
        format!(
            " frames ok/drop/dup/err {}/{}/{}/{} retries {} jitter {:?}",
            snap.successful_frames,
            snap.dropped_frames,
            snap.duplicate_frames,
            snap.error_frames,
            snap.retry_attempts,
            snap.mean_jitter,
        )
    } else {
        String::new()
    };
    info!(
        id = record.id,
        local = %local.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
        remote = %remote.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
        sent = record.stats.bytes_sent(),
        recv = record.stats.bytes_recv(),
        elapsed = ?record.stats.elapsed(),
        "connection {}{}",
        verdict,
        snapshot_note,
    );

    // sockets are gone by here; aggregate, notify, then mark reapable
    ctx.global.aggregate(&record.stats, verdict.is_success());
    ctx.observer.closing(was_active);
    apply_on_error_policy(&ctx.config, verdict);
    record.set_state(ConnState::Closed);
    record.closed.store(true, Ordering::SeqCst);
}

/// With `on_error = break`, hand control to a debugger at the first failure
fn apply_on_error_policy(config: &Config, verdict: Verdict) {
    if verdict.is_success() || config.on_error == OnError::Log {
        return;
    }
    #[cfg(unix)]
    // SAFETY: raising SIGTRAP only transfers control to a debugger or the
    // default handler; no memory is touched.
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
    #[cfg(not(unix))]
    std::process::abort();
}

fn establish(
    ctx: &ConnectionContext,
    record: &ConnectionRecord,
) -> Result<Option<Endpoint>, EngineError> {
    match (ctx.config.role, ctx.config.protocol) {
        (Role::Connect, Protocol::Tcp) => {
            record.set_state(ConnState::Connecting);
            let connector = ctx
                .connector
                .as_ref()
                .ok_or_else(|| EngineError::Resource("no connector".into()))?;
            let (stream, remote) = connector.connect()?;
            *record.local_addr.lock() = stream.local_addr().ok();
            *record.remote_addr.lock() = Some(remote);
            Ok(Some(Endpoint::Tcp(stream)))
        }
        (Role::Listen, Protocol::Tcp) => {
            record.set_state(ConnState::Accepting);
            let acceptor = ctx
                .tcp_acceptor
                .as_ref()
                .ok_or_else(|| EngineError::Resource("no acceptor".into()))?;
            match acceptor.accept(&ctx.cancel)? {
                Some((stream, peer)) => {
                    *record.local_addr.lock() = stream.local_addr().ok();
                    *record.remote_addr.lock() = Some(peer);
                    Ok(Some(Endpoint::Tcp(stream)))
                }
                None => Ok(None),
            }
        }
        (Role::Connect, Protocol::Udp) => {
            record.set_state(ConnState::Connecting);
            let connector = ctx
                .connector
                .as_ref()
                .ok_or_else(|| EngineError::Resource("no connector".into()))?;
            let (socket, remote) = connector.udp_connect()?;
            *record.local_addr.lock() = socket.local_addr().ok();
            *record.remote_addr.lock() = Some(remote);
            Ok(Some(Endpoint::UdpClient(socket)))
        }
        (Role::Listen, Protocol::Udp) => {
            record.set_state(ConnState::Accepting);
            let acceptor = ctx
                .udp_acceptor
                .as_ref()
                .ok_or_else(|| EngineError::Resource("no acceptor".into()))?;
            let max_datagram = max_datagram_len(&ctx.config);
            match acceptor.accept(&ctx.cancel, max_datagram)? {
                Some((socket, peer)) => {
                    *record.local_addr.lock() = socket.local_addr().ok();
                    *record.remote_addr.lock() = Some(peer);
                    Ok(Some(Endpoint::UdpServer(socket, peer)))
                }
                None => Ok(None),
            }
        }
    }
}

fn max_datagram_len(config: &Config) -> usize {
    config
        .media
        .map(|m| media::HEADER_LEN + m.frame_size_bytes() as usize)
        .unwrap_or(media::HEADER_LEN)
        .max(2048)
}

// ---------------------------------------------------------------------------
// stream driver
// ---------------------------------------------------------------------------

/// Work orders dispatched to the I/O halves
enum IoOrder {
    Send(Vec<u8>),
    Recv(usize),
}

/// Completion messages posted back to the driver
enum IoDone {
    Sent { bytes: usize, status: i32 },
    Recvd { data: Vec<u8>, status: i32 },
}

fn run_stream(ctx: &ConnectionContext, record: &ConnectionRecord, stream: TcpStream) -> Verdict {
    let mut rng = rand::thread_rng();
    let transfer = ctx.config.transfer.sample(&mut rng);
    let buffer = ctx.config.buffer_size.sample(&mut rng) as usize;
    let rate = ctx.config.rate_limit.map(|range| {
        PeriodBudget::new(
            range.sample(&mut rng),
            ctx.config.rate_limit_period(),
            Instant::now(),
        )
    });
    let mut pattern = StreamPattern::new(
        &ctx.config,
        transfer,
        buffer,
        rate,
        Arc::clone(&record.stats),
    );
    record.set_state(ConnState::Io);
    drive_stream(stream, &mut pattern, &ctx.cancel)
}

/// Pump the pattern engine: tasks fan out to the send/recv halves, their
/// completion messages fold back in, and the engine's verdict ends the run.
fn drive_stream(stream: TcpStream, pattern: &mut StreamPattern, cancel: &CancelToken) -> Verdict {
    let (send_tx, send_rx) = unbounded::<IoOrder>();
    let (recv_tx, recv_rx) = unbounded::<IoOrder>();
    let (done_tx, done_rx) = unbounded::<IoDone>();

    let send_half = match stream.try_clone() {
        Ok(clone) => spawn_send_half(clone, send_rx, done_tx.clone()),
        Err(e) => return Verdict::Io(status_code(&e)),
    };
    let recv_half = match stream.try_clone() {
        Ok(clone) => spawn_recv_half(clone, recv_rx, done_tx, cancel.clone()),
        Err(e) => {
            drop(send_tx);
            let _ = send_half.join();
            return Verdict::Io(status_code(&e));
        }
    };

    let verdict = loop {
        if cancel.is_cancelled() && pattern.verdict().is_none() {
            pattern.abort(cancel_verdict(cancel));
        }

        match pattern.next_task(Instant::now()) {
            NextStep::Task(StreamTask::Send { offset, len }) => {
                let mut buf = vec![0u8; len];
                payload::fill(offset, &mut buf);
                let _ = send_tx.send(IoOrder::Send(buf));
            }
            NextStep::Task(StreamTask::SendTrailer { status }) => {
                let _ = send_tx.send(IoOrder::Send(encode_trailer(status).to_vec()));
            }
            NextStep::Task(StreamTask::Recv { len }) => {
                let _ = recv_tx.send(IoOrder::Recv(len));
            }
            NextStep::Task(StreamTask::WaitUntil(at)) => {
                let wait = at
                    .saturating_duration_since(Instant::now())
                    .min(IO_POLL_INTERVAL);
                if let Ok(done) = done_rx.recv_timeout(wait) {
                    apply_completion(pattern, done);
                }
            }
            NextStep::Idle => match done_rx.recv_timeout(IO_POLL_INTERVAL) {
                Ok(done) => apply_completion(pattern, done),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // both halves died without reporting; treat as reset
                    pattern.abort(Verdict::Io(-1));
                }
            },
            NextStep::Done(verdict) => break verdict,
        }

        // keep the engine current without blocking
        while let Ok(done) = done_rx.try_recv() {
            apply_completion(pattern, done);
        }
    };

    drop(send_tx);
    drop(recv_tx);
    let _ = stream.shutdown(Shutdown::Both);
    let _ = send_half.join();
    let _ = recv_half.join();
    verdict
}

fn apply_completion(pattern: &mut StreamPattern, done: IoDone) {
    match done {
        IoDone::Sent { bytes, status } => {
            pattern.complete_task(Completion::Send { bytes, status });
        }
        IoDone::Recvd { data, status } => {
            pattern.complete_task(Completion::Recv {
                data: &data,
                status,
            });
        }
    }
}

fn spawn_send_half(
    mut stream: TcpStream,
    orders: Receiver<IoOrder>,
    done: Sender<IoDone>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        use std::io::Write;
        for order in orders.iter() {
            let IoOrder::Send(buf) = order else { continue };
            let status = match stream.write_all(&buf) {
                Ok(()) => 0,
                Err(e) => status_code(&e),
            };
            let failed = status != 0;
            if done
                .send(IoDone::Sent {
                    bytes: buf.len(),
                    status,
                })
                .is_err()
                || failed
            {
                break;
            }
        }
    })
}

fn spawn_recv_half(
    mut stream: TcpStream,
    orders: Receiver<IoOrder>,
    done: Sender<IoDone>,
    cancel: CancelToken,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for order in orders.iter() {
            let IoOrder::Recv(len) = order else { continue };
            let Some(result) = blocking_read(&mut stream, len, &cancel) else {
                break;
            };
            let failed = matches!(result, IoDone::Recvd { status, .. } if status != 0);
            if done.send(result).is_err() || failed {
                break;
            }
        }
    })
}

/// One read, retried across poll timeouts; None means cancelled
fn blocking_read(stream: &mut TcpStream, len: usize, cancel: &CancelToken) -> Option<IoDone> {
    let mut buf = vec![0u8; len];
    loop {
        match stream.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Some(IoDone::Recvd {
                    data: buf,
                    status: 0,
                });
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if cancel.is_cancelled() {
                    return None;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Some(IoDone::Recvd {
                    data: Vec::new(),
                    status: status_code(&e),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// datagram drivers
// ---------------------------------------------------------------------------

fn run_media_client(ctx: &ConnectionContext, record: &ConnectionRecord, socket: UdpSocket) -> Verdict {
    let media_cfg = match ctx.config.media {
        Some(media_cfg) => media_cfg,
        None => return Verdict::Resource,
    };
    let socket = Arc::new(socket);
    if let Err(e) = socket.send(&media::encode_start_request()) {
        return Verdict::Io(status_code(&e));
    }
    record.set_state(ConnState::Io);

    let mut receiver = StreamReceiver::new(
        &media_cfg,
        ctx.config.verify,
        Arc::clone(&record.dgram),
        Instant::now(),
    );

    // arrivals flow from the socket thread into the paced processor
    let (frame_tx, frame_rx) = unbounded::<(Vec<u8>, Instant)>();
    let stop = Arc::new(AtomicBool::new(false));
    let ingest_thread = {
        let socket = Arc::clone(&socket);
        let stats = Arc::clone(&record.stats);
        let cancel = ctx.cancel.clone();
        let stop = Arc::clone(&stop);
        let max_datagram = max_datagram_len(&ctx.config);
        thread::spawn(move || {
            let mut buf = vec![0u8; max_datagram];
            loop {
                match socket.recv(&mut buf) {
                    Ok(n) => {
                        stats.record_recv(n.saturating_sub(media::HEADER_LEN) as u64);
                        if frame_tx.send((buf[..n].to_vec(), Instant::now())).is_err() {
                            break;
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
                if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    break;
                }
            }
        })
    };

    let verdict = loop {
        if ctx.cancel.is_cancelled() {
            break cancel_verdict(&ctx.cancel);
        }
        while let Ok((datagram, at)) = frame_rx.try_recv() {
            receiver.ingest(&datagram, at);
        }
        match receiver.poll(Instant::now()) {
            ReceiveStep::Request(request) => {
                if let Err(e) = socket.send(&request) {
                    break Verdict::Io(status_code(&e));
                }
            }
            ReceiveStep::Sleep(at) => {
                let wait = at
                    .saturating_duration_since(Instant::now())
                    .min(IO_POLL_INTERVAL);
                if let Ok((datagram, arrived)) = frame_rx.recv_timeout(wait) {
                    receiver.ingest(&datagram, arrived);
                }
            }
            ReceiveStep::Finished => {
                let snap = record.dgram.snapshot();
                break if snap.dropped_frames == 0 && snap.error_frames == 0 {
                    Verdict::Success
                } else {
                    // loss is diagnosed through the frame counters
                    Verdict::Io(-1)
                };
            }
        }
    };

    stop.store(true, Ordering::Relaxed);
    drop(frame_rx);
    let _ = ingest_thread.join();
    verdict
}

fn run_media_server(
    ctx: &ConnectionContext,
    record: &ConnectionRecord,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
) -> Verdict {
    let media_cfg = match ctx.config.media {
        Some(media_cfg) => media_cfg,
        None => return Verdict::Resource,
    };
    record.set_state(ConnState::Io);

    let mut sender = StreamSender::new(&media_cfg, Instant::now());
    let frame_payload = sender.frame_size() as u64;
    let mut buf = vec![0u8; max_datagram_len(&ctx.config)];
    // keep serving resend requests for a while after the last frame
    let linger = media_cfg.buffer_depth().max(Duration::from_secs(1));
    let mut finished_at: Option<Instant> = None;

    loop {
        if ctx.cancel.is_cancelled() {
            return cancel_verdict(&ctx.cancel);
        }
        let now = Instant::now();
        let wake = match sender.poll(now) {
            SendStep::Frame(frame) => {
                if let Err(e) = socket.send_to(&frame, peer) {
                    return Verdict::Io(status_code(&e));
                }
                record.stats.record_sent(frame_payload);
                continue;
            }
            SendStep::Sleep(at) => at,
            SendStep::Finished => {
                let done_at = *finished_at.get_or_insert(now);
                if now >= done_at + linger {
                    return Verdict::Success;
                }
                done_at + linger
            }
        };

        let timeout = wake
            .saturating_duration_since(Instant::now())
            .clamp(Duration::from_millis(1), IO_POLL_INTERVAL);
        if socket.set_read_timeout(Some(timeout)).is_err() {
            continue;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, from)) if from == peer => {
                if let Ok(header) = media::FrameHeader::decode(&buf[..len]) {
                    if header.is_request && header.sequence > 0 {
                        if let Some(frame) = sender.handle_request(header.sequence, Instant::now())
                        {
                            if let Err(e) = socket.send_to(&frame, peer) {
                                return Verdict::Io(status_code(&e));
                            }
                            record.stats.record_sent(frame_payload);
                        }
                    }
                }
            }
            Ok(_) => {} // datagrams from other peers are not ours to judge
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Verdict::Io(status_code(&e)),
        }
    }
}
