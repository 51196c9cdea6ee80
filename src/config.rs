//! Run configuration
//! Immutable after startup; constructed once and passed by reference into every component

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_TRANSFER: u64 = 0x4000_0000; // 1 GiB
pub const DEFAULT_BUFFER_SIZE: u64 = 0x10000; // 64 KiB
pub const DEFAULT_TCP_CONNECTION_LIMIT: u32 = 8;
pub const DEFAULT_UDP_CONNECTION_LIMIT: u32 = 1;
pub const DEFAULT_ACCEPT_LIMIT: u32 = 10;
pub const DEFAULT_THROTTLE_LIMIT: u32 = 1000;
pub const DEFAULT_PUSH_BYTES: u64 = 0x100000; // 1 MiB
pub const DEFAULT_PULL_BYTES: u64 = 0x100000;
pub const DEFAULT_RATE_LIMIT_PERIOD_MS: u64 = 100;
pub const DEFAULT_STATUS_UPDATE_MS: u64 = 5000;

/// Whether this process dials out or accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connect,
    Listen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// The prescribed byte movement per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPattern {
    /// Client sends the transfer total, server receives it
    Push,
    /// Client receives the transfer total, server sends it
    Pull,
    /// Alternating send/recv phases of push-bytes / pull-bytes
    PushPull,
    /// Both directions move the transfer total concurrently
    Duplex,
    /// Framed unreliable downlink at a fixed frame rate (UDP only)
    DatagramStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Only the connection-level exchange is validated
    Connection,
    /// Every received byte is checked against the shared pattern
    Data,
}

/// Client policy for frames missing at the processing deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    NoResends,
    ResendOnce,
}

/// What to do when a connection ends in a non-success verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Log,
    Break,
}

/// A fixed value or a uniform [low, high] range sampled once per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRange {
    pub low: u64,
    pub high: u64,
}

impl ValueRange {
    pub fn fixed(value: u64) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    pub fn is_fixed(&self) -> bool {
        self.high <= self.low
    }

    /// Sample one value; fixed ranges avoid touching the RNG
    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        if self.is_fixed() {
            self.low
        } else {
            rng.gen_range(self.low..=self.high)
        }
    }
}

/// Parameters for the datagram streaming pattern
#[derive(Debug, Clone, Copy)]
pub struct MediaConfig {
    pub bits_per_second: u64,
    pub frames_per_second: u32,
    pub buffer_depth_secs: u32,
    pub stream_length_secs: u32,
    pub codec: StreamCodec,
}

impl MediaConfig {
    /// Payload bytes per frame, rounded down to a byte boundary
    pub fn frame_size_bytes(&self) -> u64 {
        self.bits_per_second / (self.frames_per_second as u64 * 8)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.frames_per_second as u64)
    }

    pub fn total_frames(&self) -> u64 {
        self.frames_per_second as u64 * self.stream_length_secs as u64
    }

    pub fn buffer_depth(&self) -> Duration {
        Duration::from_secs(self.buffer_depth_secs as u64)
    }
}

/// Immutable run configuration shared by the broker and all connections
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub protocol: Protocol,
    pub pattern: IoPattern,

    /// Remote endpoints for the connect role, rotated per connection
    pub target_addresses: Vec<SocketAddr>,
    /// Local endpoints for the listen role
    pub listen_addresses: Vec<SocketAddr>,
    /// Optional local bind endpoints for the connect role, rotated per connection
    pub bind_addresses: Vec<SocketAddr>,
    /// Explicit local port range for outgoing connections; 0 = ephemeral
    pub local_port_low: u16,
    pub local_port_high: u16,

    pub buffer_size: ValueRange,
    pub transfer: ValueRange,
    pub push_bytes: u64,
    pub pull_bytes: u64,

    /// Send pacing in bytes/second; None = unlimited
    pub rate_limit: Option<ValueRange>,
    pub rate_limit_period_ms: u64,

    pub connection_limit: u32,
    /// 0 = unbounded
    pub iterations: u64,
    pub accept_limit: u32,
    pub throttle_limit: u32,
    /// 0 = unbounded
    pub server_exit_limit: u64,

    pub verify: VerifyMode,
    pub pre_post_recvs: usize,
    pub time_limit: Option<Duration>,
    pub status_update: Duration,
    pub on_error: OnError,

    pub media: Option<MediaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Connect,
            protocol: Protocol::Tcp,
            pattern: IoPattern::Push,
            target_addresses: Vec::new(),
            listen_addresses: Vec::new(),
            bind_addresses: Vec::new(),
            local_port_low: 0,
            local_port_high: 0,
            buffer_size: ValueRange::fixed(DEFAULT_BUFFER_SIZE),
            transfer: ValueRange::fixed(DEFAULT_TRANSFER),
            push_bytes: DEFAULT_PUSH_BYTES,
            pull_bytes: DEFAULT_PULL_BYTES,
            rate_limit: None,
            rate_limit_period_ms: DEFAULT_RATE_LIMIT_PERIOD_MS,
            connection_limit: DEFAULT_TCP_CONNECTION_LIMIT,
            iterations: 0,
            accept_limit: DEFAULT_ACCEPT_LIMIT,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            server_exit_limit: 0,
            verify: VerifyMode::Data,
            pre_post_recvs: 1,
            time_limit: None,
            status_update: Duration::from_millis(DEFAULT_STATUS_UPDATE_MS),
            on_error: OnError::Log,
            media: None,
        }
    }
}

impl Config {
    /// Validate cross-field constraints and normalize derived values.
    ///
    /// Returns the normalized configuration so callers can write
    /// `let config = config.validated()?;` once at startup.
    pub fn validated(mut self) -> Result<Self, EngineError> {
        match self.role {
            Role::Connect => {
                if self.target_addresses.is_empty() {
                    return Err(EngineError::InvalidConfig(
                        "connect role requires at least one target address".into(),
                    ));
                }
            }
            Role::Listen => {
                if self.listen_addresses.is_empty() {
                    return Err(EngineError::InvalidConfig(
                        "listen role requires at least one listen address".into(),
                    ));
                }
            }
        }

        if self.buffer_size.low == 0 {
            return Err(EngineError::InvalidConfig("buffer size must be non-zero".into()));
        }
        if self.connection_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "connection limit must be non-zero".into(),
            ));
        }
        if self.pre_post_recvs == 0 {
            return Err(EngineError::InvalidConfig(
                "pre-post recvs must be non-zero".into(),
            ));
        }
        if self.rate_limit_period_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "rate limit period must be non-zero".into(),
            ));
        }
        // a zero rate means unlimited
        if let Some(rate) = self.rate_limit {
            if rate.low == 0 && rate.high == 0 {
                self.rate_limit = None;
            } else if rate.low == 0 {
                return Err(EngineError::InvalidConfig(
                    "rate limit range must start above zero".into(),
                ));
            }
        }
        if self.local_port_high != 0 && self.local_port_high < self.local_port_low {
            return Err(EngineError::InvalidConfig("local port range is inverted".into()));
        }

        if self.pattern == IoPattern::PushPull && (self.push_bytes == 0 || self.pull_bytes == 0) {
            return Err(EngineError::InvalidConfig(
                "push-pull requires non-zero push and pull bytes".into(),
            ));
        }

        if self.pattern == IoPattern::DatagramStream {
            if self.protocol != Protocol::Udp {
                return Err(EngineError::InvalidConfig(
                    "datagram streaming requires the UDP protocol".into(),
                ));
            }
            let mut media = self.media.ok_or_else(|| {
                EngineError::InvalidConfig("datagram streaming requires stream parameters".into())
            })?;
            // bits/sec must describe whole bytes
            media.bits_per_second -= media.bits_per_second % 8;
            if media.bits_per_second == 0 {
                return Err(EngineError::InvalidConfig("bits/second is required".into()));
            }
            if media.frames_per_second == 0 {
                return Err(EngineError::InvalidConfig("frames/second is required".into()));
            }
            if media.stream_length_secs == 0 {
                return Err(EngineError::InvalidConfig("stream length is required".into()));
            }
            // buffer depth only matters on the receiving client
            if self.role == Role::Connect && media.buffer_depth_secs == 0 {
                return Err(EngineError::InvalidConfig(
                    "buffer depth is required on the client".into(),
                ));
            }
            if media.frame_size_bytes() == 0 {
                return Err(EngineError::InvalidConfig(
                    "bits/second too low for the configured frame rate".into(),
                ));
            }
            self.media = Some(media);
        } else if self.protocol == Protocol::Udp {
            return Err(EngineError::InvalidConfig(
                "UDP supports only the datagram streaming pattern".into(),
            ));
        }

        Ok(self)
    }

    /// Total connection records this run will ever create.
    ///
    /// Connect role: iterations x connection_limit (saturating; 0 iterations
    /// means unbounded). Listen role: the server exit limit (0 = unbounded).
    pub fn total_connections(&self) -> u64 {
        match self.role {
            Role::Connect => {
                if self.iterations == 0 {
                    u64::MAX
                } else {
                    self.iterations.saturating_mul(self.connection_limit as u64)
                }
            }
            Role::Listen => {
                if self.server_exit_limit == 0 {
                    u64::MAX
                } else {
                    self.server_exit_limit
                }
            }
        }
    }

    /// Upper bound on simultaneously pending (not yet established) connections,
    /// clamped so it never exceeds the total work remaining.
    pub fn pending_limit(&self) -> u64 {
        let base = match self.role {
            Role::Connect => self.connection_limit as u64,
            Role::Listen => self.accept_limit as u64,
        };
        base.min(self.total_connections())
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Connect
    }

    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_millis(self.rate_limit_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn client_config() -> Config {
        Config {
            target_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn default_config_validates_with_target() {
        assert!(client_config().validated().is_ok());
    }

    #[test]
    fn connect_role_requires_target() {
        let config = Config::default();
        assert!(config.validated().is_err());
    }

    #[test]
    fn udp_requires_datagram_stream() {
        let config = Config {
            protocol: Protocol::Udp,
            pattern: IoPattern::Push,
            ..client_config()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn media_bits_rounded_to_bytes() {
        let config = Config {
            protocol: Protocol::Udp,
            pattern: IoPattern::DatagramStream,
            media: Some(MediaConfig {
                bits_per_second: 1_000_007,
                frames_per_second: 30,
                buffer_depth_secs: 1,
                stream_length_secs: 10,
                codec: StreamCodec::NoResends,
            }),
            ..client_config()
        };
        let validated = config.validated().unwrap();
        assert_eq!(validated.media.unwrap().bits_per_second % 8, 0);
    }

    #[test]
    fn total_connections_saturates() {
        let config = Config {
            iterations: u64::MAX / 2,
            connection_limit: 8,
            ..client_config()
        };
        assert_eq!(config.total_connections(), u64::MAX);
    }

    #[test]
    fn pending_limit_clamped_to_total() {
        let config = Config {
            iterations: 1,
            connection_limit: 4,
            ..client_config()
        };
        // 1 iteration x 4 connections = 4 total, accept limit does not apply
        assert_eq!(config.pending_limit(), 4);

        let config = Config {
            iterations: 1,
            connection_limit: 100,
            ..client_config()
        };
        assert_eq!(config.pending_limit(), 100);
    }

    #[test]
    fn server_pending_limit_uses_accept_limit() {
        let config = Config {
            role: Role::Listen,
            listen_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            server_exit_limit: 3,
            ..Default::default()
        };
        assert_eq!(config.pending_limit(), 3);

        let config = Config {
            role: Role::Listen,
            listen_addresses: vec!["127.0.0.1:4444".parse().unwrap()],
            server_exit_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.pending_limit(), DEFAULT_ACCEPT_LIMIT as u64);
    }

    #[test]
    fn frame_size_matches_rate() {
        let media = MediaConfig {
            bits_per_second: 1_000_000,
            frames_per_second: 30,
            buffer_depth_secs: 1,
            stream_length_secs: 10,
            codec: StreamCodec::NoResends,
        };
        // 1 Mbps at 30 fps = 4166 bytes per frame
        assert_eq!(media.frame_size_bytes(), 4166);
        assert_eq!(media.total_frames(), 300);
    }

    proptest! {
        #[test]
        fn range_sample_within_bounds(low in 1u64..1_000_000, span in 0u64..1_000_000) {
            let range = ValueRange::new(low, low + span);
            let mut rng = rand::thread_rng();
            let value = range.sample(&mut rng);
            prop_assert!(value >= low && value <= low + span);
        }

        #[test]
        fn fixed_range_is_deterministic(value in 1u64..u64::MAX) {
            let range = ValueRange::fixed(value);
            let mut rng = rand::thread_rng();
            prop_assert_eq!(range.sample(&mut rng), value);
            prop_assert!(range.is_fixed());
        }
    }
}
