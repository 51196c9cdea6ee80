//! Command-line entry point
//! Thin adapter: parses options, builds the immutable run configuration,
//! hands off to the engine and maps the outcome to an exit code

use std::net::{SocketAddr, ToSocketAddrs};
use std::process;

use clap::{Parser, ValueEnum};

use netgauge::{
    CancelToken, Config, EngineError, IoPattern, MediaConfig, OnError, Protocol, Role, StreamCodec,
    ValueRange, VerifyMode, DEFAULT_PORT, DEFAULT_TCP_CONNECTION_LIMIT,
    DEFAULT_UDP_CONNECTION_LIMIT,
};

/// Network traffic generator and protocol-integrity verifier
#[derive(Parser, Debug)]
#[command(name = "netgauge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate network traffic and verify protocol integrity", long_about = None)]
struct Args {
    /// Listen for connections on these addresses (server role); "*" = any
    #[arg(long, value_name = "ADDR", conflicts_with = "target")]
    listen: Vec<String>,

    /// Connect to these addresses (client role)
    #[arg(long, value_name = "ADDR")]
    target: Vec<String>,

    /// Bind outgoing connections to these local addresses
    #[arg(long, value_name = "ADDR")]
    bind: Vec<String>,

    /// Port applied to addresses given without one
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local port range LOW[:HIGH] for outgoing connections
    #[arg(long, value_name = "LOW[:HIGH]", value_parser = parse_range)]
    local_port: Option<ValueRange>,

    #[arg(long, value_enum, default_value = "tcp")]
    protocol: CliProtocol,

    /// Stream I/O pattern (TCP only; UDP always runs the datagram stream)
    #[arg(long, value_enum, default_value = "push")]
    pattern: CliPattern,

    /// Bytes per I/O, fixed or "low:high"
    #[arg(long, value_name = "N[:M]", value_parser = parse_range)]
    buffer: Option<ValueRange>,

    /// Bytes to move per direction per connection, fixed or "low:high"
    #[arg(long, value_name = "N[:M]", value_parser = parse_range)]
    transfer: Option<ValueRange>,

    /// Bytes pushed per push-pull phase
    #[arg(long)]
    push_bytes: Option<u64>,

    /// Bytes pulled per push-pull phase
    #[arg(long)]
    pull_bytes: Option<u64>,

    /// Send pacing in bytes/second, fixed or "low:high"
    #[arg(long, value_name = "N[:M]", value_parser = parse_range)]
    rate_limit: Option<ValueRange>,

    /// Milliseconds per rate-limit slice
    #[arg(long, default_value_t = 100)]
    rate_limit_period: u64,

    /// Concurrent client connections (default 8 for TCP, 1 for UDP)
    #[arg(long)]
    connections: Option<u32>,

    /// Passes of --connections; 0 = run until interrupted
    #[arg(long, default_value_t = 0)]
    iterations: u64,

    /// Cap on simultaneous outgoing connection attempts
    #[arg(long, default_value_t = 1000)]
    throttle: u32,

    /// Cap on simultaneously pended accepts (server)
    #[arg(long, default_value_t = 10)]
    accept_limit: u32,

    /// Server: exit after this many connections; 0 = run until interrupted
    #[arg(long, default_value_t = 0)]
    server_exit_limit: u64,

    #[arg(long, value_enum, default_value = "data")]
    verify: CliVerify,

    /// Receives kept in flight per connection (default 1 TCP, 2 UDP)
    #[arg(long)]
    pre_post_recvs: Option<usize>,

    /// Overall deadline in seconds
    #[arg(long, value_name = "SECS")]
    time_limit: Option<u64>,

    /// Milliseconds between status lines
    #[arg(long, default_value_t = 5000)]
    status_update_ms: u64,

    #[arg(long, value_enum, default_value = "log")]
    on_error: CliOnError,

    /// Datagram stream rate (UDP)
    #[arg(long)]
    bits_per_second: Option<u64>,

    /// Datagram frames per second (UDP)
    #[arg(long)]
    frame_rate: Option<u32>,

    /// Client-side buffering depth in seconds (UDP)
    #[arg(long)]
    buffer_depth: Option<u32>,

    /// Stream length in seconds (UDP)
    #[arg(long)]
    stream_length: Option<u32>,

    /// Missing-frame policy (UDP)
    #[arg(long, value_enum, default_value = "no-resends")]
    codec: CliCodec,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliPattern {
    Push,
    Pull,
    PushPull,
    Duplex,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliVerify {
    Connection,
    Data,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOnError {
    Log,
    Break,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCodec {
    NoResends,
    ResendOnce,
}

/// Parse "N" or "N:M" into a value range
fn parse_range(raw: &str) -> Result<ValueRange, String> {
    let parse = |part: &str| -> Result<u64, String> {
        part.parse::<u64>()
            .map_err(|_| format!("not a number: {part}"))
    };
    match raw.split_once(':') {
        Some((low, high)) => {
            let (low, high) = (parse(low)?, parse(high)?);
            if high < low {
                return Err(format!("inverted range: {raw}"));
            }
            Ok(ValueRange::new(low, high))
        }
        None => Ok(ValueRange::fixed(parse(raw)?)),
    }
}

/// Resolve one address argument; names go through the system resolver
fn resolve_addr(raw: &str, port: u16) -> Result<SocketAddr, EngineError> {
    if raw == "*" {
        return Ok(SocketAddr::new("0.0.0.0".parse().unwrap(), port));
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = raw.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (raw, port)
        .to_socket_addrs()
        .map_err(|e| EngineError::InvalidConfig(format!("cannot resolve {raw}: {e}")))?
        .next()
        .ok_or_else(|| EngineError::InvalidConfig(format!("no addresses for {raw}")))
}

fn resolve_addrs(raw: &[String], port: u16) -> Result<Vec<SocketAddr>, EngineError> {
    raw.iter().map(|value| resolve_addr(value, port)).collect()
}

fn build_config(args: Args) -> Result<Config, EngineError> {
    if args.listen.is_empty() && args.target.is_empty() {
        return Err(EngineError::InvalidConfig(
            "either --listen or --target is required".into(),
        ));
    }
    let role = if args.listen.is_empty() {
        Role::Connect
    } else {
        Role::Listen
    };
    let protocol = match args.protocol {
        CliProtocol::Tcp => Protocol::Tcp,
        CliProtocol::Udp => Protocol::Udp,
    };
    let pattern = match protocol {
        Protocol::Udp => IoPattern::DatagramStream,
        Protocol::Tcp => match args.pattern {
            CliPattern::Push => IoPattern::Push,
            CliPattern::Pull => IoPattern::Pull,
            CliPattern::PushPull => IoPattern::PushPull,
            CliPattern::Duplex => IoPattern::Duplex,
        },
    };

    let media = if protocol == Protocol::Udp {
        Some(MediaConfig {
            bits_per_second: args.bits_per_second.ok_or_else(|| {
                EngineError::InvalidConfig("--bits-per-second is required for UDP".into())
            })?,
            frames_per_second: args.frame_rate.ok_or_else(|| {
                EngineError::InvalidConfig("--frame-rate is required for UDP".into())
            })?,
            buffer_depth_secs: args.buffer_depth.unwrap_or(0),
            stream_length_secs: args.stream_length.ok_or_else(|| {
                EngineError::InvalidConfig("--stream-length is required for UDP".into())
            })?,
            codec: match args.codec {
                CliCodec::NoResends => StreamCodec::NoResends,
                CliCodec::ResendOnce => StreamCodec::ResendOnce,
            },
        })
    } else {
        None
    };

    let (local_port_low, local_port_high) = match args.local_port {
        Some(range) => {
            if range.high > u16::MAX as u64 {
                return Err(EngineError::InvalidConfig("local port out of range".into()));
            }
            (range.low as u16, range.high as u16)
        }
        None => (0, 0),
    };

    let defaults = Config::default();
    let mut config = Config {
        role,
        protocol,
        pattern,
        target_addresses: resolve_addrs(&args.target, args.port)?,
        listen_addresses: resolve_addrs(&args.listen, args.port)?,
        // bind addresses default to an ephemeral port
        bind_addresses: resolve_addrs(&args.bind, 0)?,
        local_port_low,
        local_port_high,
        buffer_size: args.buffer.unwrap_or(defaults.buffer_size),
        transfer: args.transfer.unwrap_or(defaults.transfer),
        push_bytes: args.push_bytes.unwrap_or(defaults.push_bytes),
        pull_bytes: args.pull_bytes.unwrap_or(defaults.pull_bytes),
        rate_limit: args.rate_limit,
        rate_limit_period_ms: args.rate_limit_period,
        ..defaults
    };
    config.connection_limit = args.connections.unwrap_or(match protocol {
        Protocol::Tcp => DEFAULT_TCP_CONNECTION_LIMIT,
        Protocol::Udp => DEFAULT_UDP_CONNECTION_LIMIT,
    });
    config.iterations = args.iterations;
    config.throttle_limit = args.throttle;
    config.accept_limit = args.accept_limit;
    config.server_exit_limit = args.server_exit_limit;
    config.verify = match args.verify {
        CliVerify::Connection => VerifyMode::Connection,
        CliVerify::Data => VerifyMode::Data,
    };
    config.pre_post_recvs = args.pre_post_recvs.unwrap_or(match protocol {
        Protocol::Tcp => 1,
        Protocol::Udp => 2,
    });
    config.time_limit = args.time_limit.map(std::time::Duration::from_secs);
    config.status_update = std::time::Duration::from_millis(args.status_update_ms);
    config.on_error = match args.on_error {
        CliOnError::Log => OnError::Log,
        CliOnError::Break => OnError::Break,
    };
    config.media = media;
    Ok(config)
}

/// Route ctrl-c into the cancellation token
#[cfg(unix)]
fn install_interrupt_handler(cancel: CancelToken) {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_interrupt(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    // SAFETY: the handler only touches a static atomic, which is
    // async-signal-safe.
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            cancel.cancel(netgauge::CancelReason::User);
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    });
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("netgauge: {err}");
            process::exit(2);
        }
    };

    let cancel = CancelToken::new();
    #[cfg(unix)]
    install_interrupt_handler(cancel.clone());

    match netgauge::run(config, cancel) {
        Ok(summary) => process::exit(summary.exit_code()),
        Err(err) => {
            eprintln!("netgauge: {err}");
            process::exit(2);
        }
    }
}
