//! netgauge
//! Configurable network traffic generator and protocol-integrity verifier.
//!
//! A broker maintains a pool of client or server connections; each connection
//! runs a per-pattern I/O engine (push / pull / push-pull / duplex over TCP,
//! or a paced datagram stream over UDP) against a deterministic shared
//! payload, measures throughput and loss, and ends in a single verdict.

mod broker;
mod cancel;
mod config;
mod connection;
mod error;
mod media;
mod pattern;
pub mod payload;
mod rate_limiter;
mod run;
mod sockets;
mod stats;

#[cfg(test)]
mod tests;

pub use broker::Broker;
pub use cancel::{CancelReason, CancelToken, Event};
pub use config::{
    Config, IoPattern, MediaConfig, OnError, Protocol, Role, StreamCodec, ValueRange, VerifyMode,
    DEFAULT_PORT, DEFAULT_TCP_CONNECTION_LIMIT, DEFAULT_UDP_CONNECTION_LIMIT,
};
pub use connection::{ConnState, ConnectionRecord};
pub use error::{EngineError, ProtocolFault, Verdict};
pub use media::{FrameHeader, ReceiveStep, SendStep, StreamReceiver, StreamSender, HEADER_LEN};
pub use pattern::{Completion, NextStep, StreamPattern, StreamTask, TRAILER_LEN};
pub use rate_limiter::{Grant, PeriodBudget};
pub use run::{run, RunSummary};
pub use stats::{
    ConnectionStats, DatagramSnapshot, DatagramStats, GlobalSnapshot, GlobalStats,
};
