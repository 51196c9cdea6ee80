//! Stream I/O pattern engine
//! Per-connection task generator: decides every send/recv, enforces transfer
//! totals and pacing, verifies received bytes, and yields the terminal verdict

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::{Config, IoPattern, Role, VerifyMode};
use crate::error::{ProtocolFault, Verdict};
use crate::payload;
use crate::rate_limiter::{Grant, PeriodBudget};
use crate::stats::ConnectionStats;

/// Length of the completion trailer closing each send direction
pub const TRAILER_LEN: usize = 4;

/// Encode the trailer: big-endian status, 0 = normal termination
pub fn encode_trailer(status: u32) -> [u8; TRAILER_LEN] {
    status.to_be_bytes()
}

/// One unit of work for the connection driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTask {
    /// Send `len` pattern bytes starting at this send-direction offset
    Send { offset: u64, len: usize },
    /// Send the 4-byte completion trailer
    SendTrailer { status: u32 },
    /// Receive up to `len` bytes; the engine consumes payload and trailer by cursor
    Recv { len: usize },
    /// Rate-limit pacing: sleep until the period boundary
    WaitUntil(Instant),
}

/// Result of asking the engine for work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Task(StreamTask),
    /// Nothing to issue until an in-flight completion arrives
    Idle,
    Done(Verdict),
}

/// A finished I/O operation reported back by the driver
pub enum Completion<'a> {
    /// `bytes` actually written (payload or trailer); non-zero status is the OS error
    Send { bytes: usize, status: i32 },
    /// Received bytes; empty with status 0 means orderly EOF
    Recv { data: &'a [u8], status: i32 },
}

/// Push-pull phase; exactly one direction is open at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending { left: u64 },
    Receiving { left: u64 },
}

/// Task generator for one stream connection.
///
/// Both peers instantiate the engine from the same configuration; the listen
/// side mirrors the connect side's directions. All calls are made under the
/// connection's serialization (one caller at a time).
pub struct StreamPattern {
    pattern: IoPattern,
    verify: VerifyMode,
    transfer: u64,
    buffer_size: usize,
    recv_depth: usize,

    // send direction
    has_send: bool,
    remaining_send: u64,
    send_offset: u64,
    in_flight_sends: usize,
    trailer_in_flight: bool,
    trailer_sent: bool,

    // recv direction
    has_recv: bool,
    recv_cursor: u64,
    in_flight_recvs: usize,
    trailer_buf: Vec<u8>,
    eof_seen: bool,

    phase: Option<Phase>,
    push_bytes: u64,
    pull_bytes: u64,

    rate: Option<PeriodBudget>,
    stats: Arc<ConnectionStats>,
    verdict: Option<Verdict>,
}

impl StreamPattern {
    pub fn new(
        config: &Config,
        transfer: u64,
        buffer_size: usize,
        rate: Option<PeriodBudget>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let client = config.role == Role::Connect;
        let (has_send, has_recv) = match config.pattern {
            IoPattern::Push => (client, !client),
            IoPattern::Pull => (!client, client),
            IoPattern::PushPull | IoPattern::Duplex => (true, true),
            IoPattern::DatagramStream => {
                unreachable!("datagram streaming uses the media engine")
            }
        };

        // the connect side opens with its push; the listen side mirrors
        let (push_bytes, pull_bytes) = if client {
            (config.push_bytes, config.pull_bytes)
        } else {
            (config.pull_bytes, config.push_bytes)
        };
        let phase = if config.pattern == IoPattern::PushPull {
            Some(if client {
                Phase::Sending {
                    left: push_bytes.min(transfer),
                }
            } else {
                // the opening receive boundary is the client's push size,
                // which lands in the swapped `pull_bytes` on this side
                Phase::Receiving {
                    left: pull_bytes.min(transfer),
                }
            })
        } else {
            None
        };

        // serialized receives keep the verification cursor simple; duplex and
        // connection-only verification may keep several receives in flight
        let recv_depth = match config.pattern {
            IoPattern::Duplex => config.pre_post_recvs,
            _ if config.verify == VerifyMode::Connection => config.pre_post_recvs,
            _ => 1,
        };

        Self {
            pattern: config.pattern,
            verify: config.verify,
            transfer,
            buffer_size,
            recv_depth,
            has_send,
            remaining_send: if has_send { transfer } else { 0 },
            send_offset: 0,
            in_flight_sends: 0,
            trailer_in_flight: false,
            trailer_sent: false,
            has_recv,
            recv_cursor: 0,
            in_flight_recvs: 0,
            trailer_buf: Vec::with_capacity(TRAILER_LEN),
            eof_seen: false,
            phase,
            push_bytes,
            pull_bytes,
            rate,
            stats,
            verdict: None,
        }
    }

    pub fn remaining_send(&self) -> u64 {
        self.remaining_send
    }

    /// Payload bytes still expected on the recv direction
    pub fn remaining_recv(&self) -> u64 {
        if self.has_recv {
            self.transfer - self.recv_cursor
        } else {
            0
        }
    }

    /// Next byte offset expected to arrive on the recv direction
    pub fn verification_cursor(&self) -> u64 {
        self.recv_cursor
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    fn send_done(&self) -> bool {
        !self.has_send || self.trailer_sent
    }

    fn recv_done(&self) -> bool {
        !self.has_recv || (self.recv_cursor == self.transfer && self.trailer_buf.len() == TRAILER_LEN)
    }

    /// Record the terminal verdict; only the first write sticks
    fn finish(&mut self, verdict: Verdict) {
        if self.verdict.is_none() {
            debug!(?verdict, "pattern complete");
            self.verdict = Some(verdict);
        }
    }

    fn check_all_done(&mut self) {
        if self.verdict.is_none() && self.send_done() && self.recv_done() {
            self.finish(Verdict::Success);
        }
    }

    /// External failure (cancellation, deadline) observed by the driver
    pub fn abort(&mut self, verdict: Verdict) {
        self.finish(verdict);
    }

    /// Whether this engine may issue a receive right now
    fn recv_open(&self) -> bool {
        if !self.has_recv || self.recv_done() || self.eof_seen {
            return false;
        }
        if self.in_flight_recvs >= self.recv_depth {
            return false;
        }
        match self.phase {
            Some(Phase::Sending { .. }) => false,
            _ => true,
        }
    }

    /// Whether this engine may issue a payload send right now
    fn send_open(&self) -> bool {
        if !self.has_send || self.remaining_send == 0 || self.in_flight_sends > 0 {
            return false;
        }
        match self.phase {
            Some(Phase::Receiving { .. }) => false,
            _ => true,
        }
    }

    fn trailer_send_open(&self) -> bool {
        self.has_send
            && self.remaining_send == 0
            && !self.trailer_sent
            && !self.trailer_in_flight
            && self.in_flight_sends == 0
            && !matches!(self.phase, Some(Phase::Receiving { .. }))
    }

    /// Decide the next unit of work
    pub fn next_task(&mut self, now: Instant) -> NextStep {
        if let Some(verdict) = self.verdict {
            return NextStep::Done(verdict);
        }

        // receives first so duplex keeps its depth pre-posted
        if self.recv_open() {
            let remaining = self.remaining_recv();
            let len = if remaining > 0 {
                (self.buffer_size as u64).min(remaining) as usize
            } else {
                // payload verified; one further receive covers the trailer
                TRAILER_LEN - self.trailer_buf.len()
            };
            self.in_flight_recvs += 1;
            return NextStep::Task(StreamTask::Recv { len });
        }

        if self.send_open() {
            let mut len = (self.buffer_size as u64).min(self.remaining_send);
            if let Some(Phase::Sending { left }) = self.phase {
                len = len.min(left);
            }
            if let Some(rate) = self.rate.as_mut() {
                match rate.grant(len as usize, now) {
                    Grant::Send(granted) => len = granted as u64,
                    Grant::WaitUntil(at) => return NextStep::Task(StreamTask::WaitUntil(at)),
                }
            }
            let offset = self.send_offset;
            self.send_offset += len;
            self.in_flight_sends += 1;
            return NextStep::Task(StreamTask::Send {
                offset,
                len: len as usize,
            });
        }

        if self.trailer_send_open() {
            self.trailer_in_flight = true;
            self.in_flight_sends += 1;
            return NextStep::Task(StreamTask::SendTrailer { status: 0 });
        }

        if self.in_flight_sends > 0 || self.in_flight_recvs > 0 {
            return NextStep::Idle;
        }

        // nothing in flight and nothing to issue: either finished, or the
        // peer owes us bytes it will never deliver
        self.check_all_done();
        match self.verdict {
            Some(verdict) => NextStep::Done(verdict),
            None => NextStep::Idle,
        }
    }

    /// Fold a finished operation back into the state machine
    pub fn complete_task(&mut self, completion: Completion<'_>) {
        match completion {
            Completion::Send { bytes, status } => self.complete_send(bytes, status),
            Completion::Recv { data, status } => self.complete_recv(data, status),
        }
    }

    fn complete_send(&mut self, bytes: usize, status: i32) {
        debug_assert!(self.in_flight_sends > 0);
        self.in_flight_sends -= 1;

        if status != 0 {
            self.finish(Verdict::Io(status));
            return;
        }

        if self.trailer_in_flight {
            self.trailer_in_flight = false;
            self.trailer_sent = true;
        } else {
            let bytes = bytes as u64;
            debug_assert!(bytes <= self.remaining_send);
            self.remaining_send -= bytes;
            self.stats.record_sent(bytes);
            if let Some(Phase::Sending { left }) = self.phase {
                let left = left - bytes.min(left);
                if left == 0 {
                    self.enter_recv_phase();
                } else {
                    self.phase = Some(Phase::Sending { left });
                }
            }
        }
        self.check_all_done();
    }

    fn complete_recv(&mut self, data: &[u8], status: i32) {
        debug_assert!(self.in_flight_recvs > 0);
        self.in_flight_recvs -= 1;

        if self.verdict.is_some() {
            return;
        }
        if status != 0 {
            self.finish(Verdict::Io(status));
            return;
        }
        if data.is_empty() {
            self.eof_seen = true;
            if !self.recv_done() {
                // graceful close mid-transfer
                let fault = if self.recv_cursor < self.transfer {
                    ProtocolFault::TooFewBytes
                } else {
                    ProtocolFault::NoCompletion
                };
                self.finish(Verdict::Protocol(fault));
            }
            return;
        }

        // split the arrival into payload at the cursor, then trailer bytes
        let payload_len = ((self.transfer - self.recv_cursor) as usize).min(data.len());
        let (payload_part, rest) = data.split_at(payload_len);

        if !payload_part.is_empty() {
            if self.verify == VerifyMode::Data {
                if let Err(offset) = payload::verify(self.recv_cursor, payload_part) {
                    self.finish(Verdict::Protocol(ProtocolFault::DataMismatch { offset }));
                    return;
                }
            }
            self.recv_cursor += payload_part.len() as u64;
            self.stats.record_recv(payload_part.len() as u64);

            if let Some(Phase::Receiving { left }) = self.phase {
                let left = left - (payload_part.len() as u64).min(left);
                if left == 0 {
                    self.enter_send_phase();
                } else {
                    self.phase = Some(Phase::Receiving { left });
                }
            }
        }

        if !rest.is_empty() {
            if self.trailer_buf.len() + rest.len() > TRAILER_LEN {
                self.finish(Verdict::Protocol(ProtocolFault::TooManyBytes));
                return;
            }
            self.trailer_buf.extend_from_slice(rest);
            if self.trailer_buf.len() == TRAILER_LEN {
                let mut raw = [0u8; TRAILER_LEN];
                raw.copy_from_slice(&self.trailer_buf);
                let remote_status = u32::from_be_bytes(raw);
                if remote_status != 0 {
                    // remote-indicated abort
                    self.finish(Verdict::Io(remote_status as i32));
                    return;
                }
            }
        }

        self.check_all_done();
    }

    fn enter_recv_phase(&mut self) {
        let remaining = self.remaining_recv();
        if remaining > 0 {
            self.phase = Some(Phase::Receiving {
                left: self.pull_bytes.min(remaining),
            });
        } else {
            // recv direction exhausted; stop gating sends
            self.phase = None;
        }
    }

    fn enter_send_phase(&mut self) {
        if self.remaining_send > 0 {
            self.phase = Some(Phase::Sending {
                left: self.push_bytes.min(self.remaining_send),
            });
        } else {
            self.phase = None;
        }
    }
}
