//! Error taxonomy and connection verdicts
//! Result values replace exception-driven control flow throughout the engine

use thiserror::Error;

/// Fatal setup / resource errors surfaced through `Result`
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Resource exhausted: {0}")]
    Resource(String),
    #[error("Thread error: {0}")]
    Thread(String),
}

/// Protocol-integrity failures observed on a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// Received bytes diverged from the shared pattern at this absolute offset
    DataMismatch { offset: u64 },
    /// Peer closed before the transfer total was reached
    TooFewBytes,
    /// Peer sent past the transfer total
    TooManyBytes,
    /// Completion trailer missing or malformed
    NoCompletion,
    /// Datagram header failed to parse
    BadFrame,
    /// Datagram sequence outside the scheduled range
    BadSequence,
}

impl std::fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFault::DataMismatch { offset } => {
                write!(f, "data mismatch at offset {offset}")
            }
            ProtocolFault::TooFewBytes => write!(f, "too few bytes"),
            ProtocolFault::TooManyBytes => write!(f, "too many bytes"),
            ProtocolFault::NoCompletion => write!(f, "no completion trailer"),
            ProtocolFault::BadFrame => write!(f, "bad frame"),
            ProtocolFault::BadSequence => write!(f, "bad sequence"),
        }
    }
}

/// Terminal outcome of one connection, written exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Transport-layer failure with the OS error code
    Io(i32),
    Protocol(ProtocolFault),
    /// Could not allocate the socket or connection resources
    Resource,
    /// Global deadline expired while this connection was still active
    TimeLimit,
    /// External cancellation
    Cancelled,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Success => write!(f, "succeeded"),
            Verdict::Io(code) => write!(f, "io error ({code})"),
            Verdict::Protocol(fault) => write!(f, "protocol error: {fault}"),
            Verdict::Resource => write!(f, "resource error"),
            Verdict::TimeLimit => write!(f, "time limit exceeded"),
            Verdict::Cancelled => write!(f, "cancelled"),
        }
    }
}
