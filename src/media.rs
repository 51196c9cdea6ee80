//! Datagram stream engine
//! Framed unreliable downlink: paced sender, sequence-tracking receiver,
//! duplicate/drop/resend accounting and jitter measurement

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::config::{MediaConfig, StreamCodec, VerifyMode};
use crate::error::ProtocolFault;
use crate::payload;
use crate::stats::DatagramStats;

/// Sequence + send timestamp + timer frequency + flagged payload length
pub const HEADER_LEN: usize = 28;

/// High bit of the payload-length field marks a control/request frame
const REQUEST_FLAG: u32 = 0x8000_0000;

/// All sender timestamps are monotonic nanoseconds
const TIMER_FREQUENCY_NS: u64 = 1_000_000_000;

/// One datagram header; integers little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub send_qpc: u64,
    pub send_qpf: u64,
    pub payload_len: u32,
    pub is_request: bool,
}

impl FrameHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut flags_len = self.payload_len;
        if self.is_request {
            flags_len |= REQUEST_FLAG;
        }
        out.put_u64_le(self.sequence);
        out.put_u64_le(self.send_qpc);
        out.put_u64_le(self.send_qpf);
        out.put_u32_le(flags_len);
    }

    /// Parse a header and cross-check the length field against the datagram
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolFault> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolFault::BadFrame);
        }
        let mut cursor = datagram;
        let sequence = cursor.get_u64_le();
        let send_qpc = cursor.get_u64_le();
        let send_qpf = cursor.get_u64_le();
        let raw_len = cursor.get_u32_le();
        let is_request = raw_len & REQUEST_FLAG != 0;
        let payload_len = raw_len & !REQUEST_FLAG;

        if send_qpf == 0 {
            return Err(ProtocolFault::BadFrame);
        }
        if payload_len as usize != datagram.len() - HEADER_LEN {
            return Err(ProtocolFault::BadFrame);
        }
        Ok(Self {
            sequence,
            send_qpc,
            send_qpf,
            payload_len,
            is_request,
        })
    }

    /// Sender timestamp normalized to nanoseconds
    pub fn send_ns(&self) -> u64 {
        if self.send_qpf == TIMER_FREQUENCY_NS {
            self.send_qpc
        } else {
            ((self.send_qpc as u128 * TIMER_FREQUENCY_NS as u128) / self.send_qpf as u128) as u64
        }
    }
}

/// Zero-payload control frame announcing the client to the server
pub fn encode_start_request() -> Vec<u8> {
    encode_control(0)
}

/// Zero-payload control frame asking the server to resend one sequence
pub fn encode_resend_request(sequence: u64) -> Vec<u8> {
    encode_control(sequence)
}

fn encode_control(sequence: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    FrameHeader {
        sequence,
        send_qpc: 0,
        send_qpf: TIMER_FREQUENCY_NS,
        payload_len: 0,
        is_request: true,
    }
    .encode_into(&mut out);
    out
}

/// What the sender's driver should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    /// Transmit this datagram now
    Frame(Vec<u8>),
    /// Nothing due before this instant
    Sleep(Instant),
    /// Every scheduled frame has been sent
    Finished,
}

/// Server-side paced frame schedule: one frame every interval, each stamped
/// with the transmit-time clock reading.
pub struct StreamSender {
    frame_size: usize,
    total_frames: u64,
    interval: Duration,
    next_seq: u64,
    next_send_at: Instant,
    resent: HashSet<u64>,
    epoch: Instant,
}

impl StreamSender {
    pub fn new(media: &MediaConfig, now: Instant) -> Self {
        Self {
            frame_size: media.frame_size_bytes() as usize,
            total_frames: media.total_frames(),
            interval: media.frame_interval(),
            next_seq: 1,
            next_send_at: now,
            resent: HashSet::new(),
            epoch: now,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn poll(&mut self, now: Instant) -> SendStep {
        if self.next_seq > self.total_frames {
            return SendStep::Finished;
        }
        if now < self.next_send_at {
            return SendStep::Sleep(self.next_send_at);
        }
        let frame = self.build_frame(self.next_seq, now);
        self.next_seq += 1;
        self.next_send_at += self.interval;
        SendStep::Frame(frame)
    }

    /// Service a resend request: best-effort, at most once per sequence
    pub fn handle_request(&mut self, sequence: u64, now: Instant) -> Option<Vec<u8>> {
        if sequence == 0 || sequence >= self.next_seq || sequence > self.total_frames {
            return None;
        }
        if !self.resent.insert(sequence) {
            return None;
        }
        debug!(sequence, "resending frame");
        Some(self.build_frame(sequence, now))
    }

    fn build_frame(&self, sequence: u64, now: Instant) -> Vec<u8> {
        let offset = (sequence - 1) * self.frame_size as u64;
        let mut out = Vec::with_capacity(HEADER_LEN + self.frame_size);
        FrameHeader {
            sequence,
            send_qpc: now.duration_since(self.epoch).as_nanos() as u64,
            send_qpf: TIMER_FREQUENCY_NS,
            payload_len: self.frame_size as u32,
            is_request: false,
        }
        .encode_into(&mut out);
        let start = out.len();
        out.resize(start + self.frame_size, 0);
        payload::fill(offset, &mut out[start..]);
        out
    }
}

/// What the receiver's paced processor should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStep {
    /// Transmit this resend-request datagram
    Request(Vec<u8>),
    /// Nothing due before this instant
    Sleep(Instant),
    /// Every scheduled sequence has been classified
    Finished,
}

struct Arrival {
    send_ns: u64,
    recv_ns: u64,
    payload_len: u32,
}

/// Client-side reassembly and classification.
///
/// Datagrams buffer as they arrive; a paced pass classifies each sequence
/// once its expected arrival time is `buffer_depth` in the past. With the
/// resend-once codec a missing sequence is requested again at half depth.
pub struct StreamReceiver {
    total_frames: u64,
    frame_size: u64,
    interval: Duration,
    buffer_depth: Duration,
    codec: StreamCodec,
    verify: VerifyMode,

    epoch: Instant,
    anchored: bool,
    arrived: HashMap<u64, Arrival>,
    requested: HashSet<u64>,
    next_process: u64,
    next_request: u64,

    stats: Arc<DatagramStats>,
}

impl StreamReceiver {
    pub fn new(
        media: &MediaConfig,
        verify: VerifyMode,
        stats: Arc<DatagramStats>,
        now: Instant,
    ) -> Self {
        Self {
            total_frames: media.total_frames(),
            frame_size: media.frame_size_bytes(),
            interval: media.frame_interval(),
            buffer_depth: media.buffer_depth(),
            codec: media.codec,
            verify,
            epoch: now,
            anchored: false,
            arrived: HashMap::new(),
            requested: HashSet::new(),
            next_process: 1,
            next_request: 1,
            stats,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn finished(&self) -> bool {
        self.next_process > self.total_frames
    }

    fn expected_arrival(&self, sequence: u64) -> Instant {
        self.epoch + self.interval * (sequence - 1) as u32
    }

    fn process_deadline(&self, sequence: u64) -> Instant {
        self.expected_arrival(sequence) + self.buffer_depth
    }

    fn request_deadline(&self, sequence: u64) -> Instant {
        self.expected_arrival(sequence) + self.buffer_depth / 2
    }

    /// Buffer one arriving datagram
    pub fn ingest(&mut self, datagram: &[u8], now: Instant) {
        use std::collections::hash_map::Entry;
        use std::sync::atomic::Ordering;

        let header = match FrameHeader::decode(datagram) {
            Ok(header) => header,
            Err(_) => {
                self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        // the downlink never carries request frames
        if header.is_request {
            self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if header.sequence == 0 || header.sequence > self.total_frames {
            self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.verify == VerifyMode::Data {
            let offset = (header.sequence - 1) * self.frame_size;
            if payload::verify(offset, &datagram[HEADER_LEN..]).is_err() {
                self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // first frame pins the schedule to the server's actual start
        if !self.anchored {
            self.anchored = true;
            self.epoch = now - self.interval * (header.sequence - 1) as u32;
        }

        // arrivals after classification are too late to change the verdict
        if header.sequence < self.next_process {
            return;
        }

        match self.arrived.entry(header.sequence) {
            Entry::Occupied(_) => {
                self.stats.duplicate_frames.fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(slot) => {
                slot.insert(Arrival {
                    send_ns: header.send_ns(),
                    recv_ns: now.duration_since(self.epoch).as_nanos() as u64,
                    payload_len: header.payload_len,
                });
                if self.requested.remove(&header.sequence) {
                    self.stats.retry_attempts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Advance the paced classification pass
    pub fn poll(&mut self, now: Instant) -> ReceiveStep {
        use std::sync::atomic::Ordering;

        // resend lookahead runs half a buffer depth ahead of classification
        if self.codec == StreamCodec::ResendOnce {
            while self.next_request <= self.total_frames
                && self.request_deadline(self.next_request) <= now
            {
                let sequence = self.next_request;
                self.next_request += 1;
                if !self.arrived.contains_key(&sequence) {
                    self.requested.insert(sequence);
                    return ReceiveStep::Request(encode_resend_request(sequence));
                }
            }
        }

        while self.next_process <= self.total_frames
            && self.process_deadline(self.next_process) <= now
        {
            let sequence = self.next_process;
            self.next_process += 1;
            match self.arrived.remove(&sequence) {
                Some(arrival) => {
                    self.stats.record_successful(arrival.payload_len as u64);
                    self.stats.record_jitter_sample(arrival.send_ns, arrival.recv_ns);
                }
                None => {
                    self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if self.finished() {
            return ReceiveStep::Finished;
        }
        let mut wake = self.process_deadline(self.next_process);
        if self.codec == StreamCodec::ResendOnce && self.next_request <= self.total_frames {
            wake = wake.min(self.request_deadline(self.next_request));
        }
        ReceiveStep::Sleep(wake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use proptest::prelude::*;

    fn media(codec: StreamCodec) -> MediaConfig {
        MediaConfig {
            bits_per_second: 1_000_000,
            frames_per_second: 30,
            buffer_depth_secs: 1,
            stream_length_secs: 10,
            codec,
        }
    }

    fn run_link(codec: StreamCodec, drop_every: Option<u64>) -> Arc<DatagramStats> {
        let cfg = media(codec);
        let start = Instant::now();
        let stats = Arc::new(DatagramStats::new());
        let mut sender = StreamSender::new(&cfg, start);
        let mut receiver =
            StreamReceiver::new(&cfg, VerifyMode::Data, Arc::clone(&stats), start);

        // simulated clock stepped frame by frame, link delay zero
        let mut now = start;
        let end = start + cfg.buffer_depth() * 2
            + cfg.frame_interval() * (cfg.total_frames() as u32 + 2);
        let tick = cfg.frame_interval() / 4;

        while now < end {
            loop {
                match sender.poll(now) {
                    SendStep::Frame(frame) => {
                        let header = FrameHeader::decode(&frame).unwrap();
                        let dropped =
                            drop_every.map_or(false, |n| header.sequence % n == 0);
                        if !dropped {
                            receiver.ingest(&frame, now);
                        }
                    }
                    SendStep::Sleep(_) | SendStep::Finished => break,
                }
            }
            loop {
                match receiver.poll(now) {
                    ReceiveStep::Request(request) => {
                        let header = FrameHeader::decode(&request).unwrap();
                        assert!(header.is_request);
                        // resends always make it through in this harness
                        if let Some(frame) = sender.handle_request(header.sequence, now) {
                            receiver.ingest(&frame, now);
                        }
                    }
                    ReceiveStep::Sleep(_) | ReceiveStep::Finished => break,
                }
            }
            if receiver.finished() {
                break;
            }
            now += tick;
        }
        assert!(receiver.finished(), "receiver never classified all frames");
        stats
    }

    #[test]
    fn header_round_trips_through_datagram() {
        let mut out = Vec::new();
        let header = FrameHeader {
            sequence: 42,
            send_qpc: 123_456_789,
            send_qpf: TIMER_FREQUENCY_NS,
            payload_len: 16,
            is_request: false,
        };
        header.encode_into(&mut out);
        out.extend_from_slice(&[0u8; 16]);
        assert_eq!(FrameHeader::decode(&out).unwrap(), header);
    }

    #[test]
    fn short_datagram_is_bad_frame() {
        assert_eq!(
            FrameHeader::decode(&[0u8; HEADER_LEN - 1]),
            Err(ProtocolFault::BadFrame)
        );
    }

    #[test]
    fn length_mismatch_is_bad_frame() {
        let mut out = Vec::new();
        FrameHeader {
            sequence: 1,
            send_qpc: 0,
            send_qpf: TIMER_FREQUENCY_NS,
            payload_len: 100,
            is_request: false,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&[0u8; 50]); // half the declared payload
        assert_eq!(FrameHeader::decode(&out), Err(ProtocolFault::BadFrame));
    }

    #[test]
    fn request_flag_survives_encoding() {
        let request = encode_resend_request(7);
        let header = FrameHeader::decode(&request).unwrap();
        assert!(header.is_request);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn sender_paces_at_frame_interval() {
        let cfg = media(StreamCodec::NoResends);
        let start = Instant::now();
        let mut sender = StreamSender::new(&cfg, start);

        assert!(matches!(sender.poll(start), SendStep::Frame(_)));
        match sender.poll(start) {
            SendStep::Sleep(at) => assert_eq!(at, start + cfg.frame_interval()),
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(
            sender.poll(start + cfg.frame_interval()),
            SendStep::Frame(_)
        ));
    }

    #[test]
    fn sender_frames_carry_pattern_payload() {
        let cfg = media(StreamCodec::NoResends);
        let start = Instant::now();
        let mut sender = StreamSender::new(&cfg, start);
        let frame = match sender.poll(start) {
            SendStep::Frame(frame) => frame,
            other => panic!("unexpected step {other:?}"),
        };
        let header = FrameHeader::decode(&frame).unwrap();
        assert_eq!(header.sequence, 1);
        assert_eq!(payload::verify(0, &frame[HEADER_LEN..]), Ok(()));
    }

    #[test]
    fn resend_is_served_exactly_once() {
        let cfg = media(StreamCodec::ResendOnce);
        let start = Instant::now();
        let mut sender = StreamSender::new(&cfg, start);
        let _ = sender.poll(start); // frame 1 sent
        assert!(sender.handle_request(1, start).is_some());
        assert!(sender.handle_request(1, start).is_none());
        // never-sent and out-of-range sequences are ignored
        assert!(sender.handle_request(2, start).is_none());
        assert!(sender.handle_request(0, start).is_none());
        assert!(sender.handle_request(10_000, start).is_none());
    }

    #[test]
    fn lossless_link_counts_all_frames() {
        let stats = run_link(StreamCodec::NoResends, None);
        let snap = stats.snapshot();
        assert_eq!(snap.successful_frames, 300);
        assert_eq!(snap.dropped_frames, 0);
        assert_eq!(snap.duplicate_frames, 0);
        assert_eq!(snap.error_frames, 0);
        assert_eq!(snap.bits_received, 300 * 4166 * 8);
    }

    #[test]
    fn no_resends_counts_losses_as_drops() {
        let stats = run_link(StreamCodec::NoResends, Some(10));
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_frames, 30);
        assert_eq!(snap.successful_frames, 270);
        // no-resends: successes and drops partition the schedule
        assert_eq!(snap.successful_frames + snap.dropped_frames, 300);
        assert_eq!(snap.retry_attempts, 0);
    }

    #[test]
    fn resend_once_recovers_single_losses() {
        let stats = run_link(StreamCodec::ResendOnce, Some(10));
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_frames, 0);
        assert_eq!(snap.successful_frames, 300);
        assert_eq!(snap.retry_attempts, 30);
    }

    #[test]
    fn duplicate_arrivals_count_once_as_success() {
        let cfg = media(StreamCodec::NoResends);
        let start = Instant::now();
        let stats = Arc::new(DatagramStats::new());
        let mut sender = StreamSender::new(&cfg, start);
        let mut receiver =
            StreamReceiver::new(&cfg, VerifyMode::Data, Arc::clone(&stats), start);

        let frame = match sender.poll(start) {
            SendStep::Frame(frame) => frame,
            other => panic!("unexpected step {other:?}"),
        };
        receiver.ingest(&frame, start);
        receiver.ingest(&frame, start);
        receiver.ingest(&frame, start);

        // classify sequence 1 after its deadline
        let late = start + cfg.buffer_depth() + cfg.frame_interval();
        let _ = receiver.poll(late);

        let snap = stats.snapshot();
        assert_eq!(snap.successful_frames, 1);
        assert_eq!(snap.duplicate_frames, 2);
    }

    #[test]
    fn corrupted_payload_counts_as_error_frame() {
        let cfg = media(StreamCodec::NoResends);
        let start = Instant::now();
        let stats = Arc::new(DatagramStats::new());
        let mut sender = StreamSender::new(&cfg, start);
        let mut receiver =
            StreamReceiver::new(&cfg, VerifyMode::Data, Arc::clone(&stats), start);

        let mut frame = match sender.poll(start) {
            SendStep::Frame(frame) => frame,
            other => panic!("unexpected step {other:?}"),
        };
        frame[HEADER_LEN + 5] ^= 0xFF;
        receiver.ingest(&frame, start);

        let snap = stats.snapshot();
        assert_eq!(snap.error_frames, 1);
        // the sequence counts as not received
        let late = start + cfg.buffer_depth() + cfg.frame_interval();
        let _ = receiver.poll(late);
        assert_eq!(stats.snapshot().dropped_frames, 1);
    }

    #[test]
    fn out_of_range_sequence_is_error() {
        let cfg = media(StreamCodec::NoResends);
        let start = Instant::now();
        let stats = Arc::new(DatagramStats::new());
        let mut receiver =
            StreamReceiver::new(&cfg, VerifyMode::Data, Arc::clone(&stats), start);

        let mut out = Vec::new();
        FrameHeader {
            sequence: 100_000,
            send_qpc: 0,
            send_qpf: TIMER_FREQUENCY_NS,
            payload_len: 0,
            is_request: false,
        }
        .encode_into(&mut out);
        receiver.ingest(&out, start);
        assert_eq!(stats.snapshot().error_frames, 1);
    }

    proptest! {
        // each case simulates a full 300-frame stream, so keep the count low
        #![proptest_config(ProptestConfig::with_cases(8))]
        #[test]
        fn classification_partitions_schedule(drop_every in 2u64..20) {
            let stats = run_link(StreamCodec::NoResends, Some(drop_every));
            let snap = stats.snapshot();
            prop_assert_eq!(snap.successful_frames + snap.dropped_frames, 300);
        }
    }
}
