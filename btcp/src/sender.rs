//! Go-Back-N send-side state machine.
//!
//! [`SendWindow`] holds the bookkeeping for one outbound byte stream: the
//! pre-built segments, how far they have been sent and acknowledged, and the
//! per-segment send instants used for the retransmission timeout.
//!
//! # Protocol contract
//!
//! - Segments are addressed by **index** into the stream, not by sequence
//!   number.  `last_acked` counts segments the receiver has acknowledged,
//!   `last_sent` counts segments handed to the transport, and
//!   `0 ≤ last_acked ≤ last_sent ≤ segments`.
//! - At most `max(peer_window, 1)` segments are in flight.  A zero window
//!   still lets one segment out so the timer can probe for reopened space.
//! - ACKs are cumulative.  The ACK number of segment `i` is the sequence
//!   number of segment `i + 1`, so translating it through the list of
//!   sequence numbers yields the new `last_acked`.
//! - Timeout and triple duplicate ACK both "go back N": timers are dropped
//!   and `last_sent` rewinds to `last_acked`, so the whole unacknowledged
//!   window is sent again.
//!
//! This module only manages state; all transport I/O is the caller's
//! responsibility.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::segment::{wrap_seq, Segment, END_OF_STREAM, MAX_PAYLOAD};

/// Duplicate ACKs for one index that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Split `data` into the segments of one stream.
///
/// Chunk `i` starts at byte offset `o = i * MAX_PAYLOAD` and carries
/// `seq = o mod 65535`, `ack = (o + len) mod 65535`.  A trailing
/// zero-payload segment with `data_length = END_OF_STREAM` closes the stream.
pub fn build_segments(data: &[u8], window: u8) -> Vec<Segment> {
    let mut segments: Vec<Segment> = data
        .chunks(MAX_PAYLOAD)
        .enumerate()
        .map(|(i, chunk)| {
            let offset = i * MAX_PAYLOAD;
            Segment::data(
                wrap_seq(offset),
                wrap_seq(offset + chunk.len()),
                window,
                chunk,
            )
        })
        .collect();

    let final_seq = wrap_seq(data.len());
    let final_ack = wrap_seq(usize::from(final_seq) + MAX_PAYLOAD);
    segments.push(Segment::end_of_stream(final_seq, final_ack, window));
    segments
}

/// What an inbound ACK did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `last_acked` moved forward.
    Advanced { last_acked: usize },
    /// Repeat of the current `last_acked`; `count` so far.
    Duplicate { count: u32 },
    /// Third duplicate: the window was rewound.
    FastRetransmit { index: usize },
    /// Older than `last_acked`, or a duplicate for an index that already
    /// triggered its fast retransmit.
    Stale,
    /// The end-of-stream segment was acknowledged.
    Finished,
    /// No stream is loaded.
    Idle,
}

/// Go-Back-N send-side state for one connection.
///
/// ```text
///   0        last_acked          last_sent           segments
///   │  acked     │ <─ in flight ─▶ │ <─ not yet sent ─▶ │
/// ```
#[derive(Debug)]
pub struct SendWindow {
    /// Encoded segments of the current stream.
    frames: Vec<Vec<u8>>,
    /// Sequence number of each segment, for ACK translation.
    seq_ns: Vec<u16>,
    /// ACK number the receiver answers the end-of-stream segment with.
    final_ack: u16,
    /// The end-of-stream segment's own `ack_n`, echoed back as the ACK's
    /// `seq_n`.  Together with `final_ack` it tells the final ACK apart from
    /// a data ACK carrying the same number.
    final_echo: u16,

    last_acked: usize,
    last_sent: usize,

    /// Most recently advertised receiver window.
    peer_window: u8,

    /// Send instant of every in-flight segment, keyed by index.
    send_times: BTreeMap<usize, Instant>,

    duplicates: u32,
    /// Highest index that already caused a fast retransmit.
    fast_retransmitted: Option<usize>,

    /// Timeouts since the peer last acknowledged anything.
    stalled_rounds: u32,
    retransmissions: u32,
    finished: bool,
}

impl SendWindow {
    /// Create an idle window; `peer_window` starts at our own configured size
    /// until the peer advertises something else.
    pub fn new(peer_window: u8) -> Self {
        Self {
            frames: Vec::new(),
            seq_ns: Vec::new(),
            final_ack: 0,
            final_echo: 0,
            last_acked: 0,
            last_sent: 0,
            peer_window,
            send_times: BTreeMap::new(),
            duplicates: 0,
            fast_retransmitted: None,
            stalled_rounds: 0,
            retransmissions: 0,
            finished: false,
        }
    }

    /// Load a new stream, resetting all per-stream bookkeeping.
    pub fn load(&mut self, data: &[u8], window: u8) {
        let segments = build_segments(data, window);
        let final_seq = wrap_seq(data.len());
        self.final_ack = wrap_seq(usize::from(final_seq) + usize::from(END_OF_STREAM));
        self.final_echo = wrap_seq(usize::from(final_seq) + MAX_PAYLOAD);
        self.seq_ns = segments.iter().map(|s| s.seq_n).collect();
        self.frames = segments.iter().map(Segment::encode).collect();
        self.last_acked = 0;
        self.last_sent = 0;
        self.send_times.clear();
        self.duplicates = 0;
        self.fast_retransmitted = None;
        self.stalled_rounds = 0;
        self.retransmissions = 0;
        self.finished = false;
    }

    pub fn set_peer_window(&mut self, window: u8) {
        self.peer_window = window;
    }

    pub fn peer_window(&self) -> u8 {
        self.peer_window
    }

    /// Number of segments in the loaded stream (end-of-stream included).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `true` while a loaded stream still awaits acknowledgement.
    pub fn is_active(&self) -> bool {
        !self.frames.is_empty() && !self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_acked(&self) -> usize {
        self.last_acked
    }

    pub fn last_sent(&self) -> usize {
        self.last_sent
    }

    /// Segments sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.last_sent - self.last_acked
    }

    pub fn stalled_rounds(&self) -> u32 {
        self.stalled_rounds
    }

    /// Go-back-N rewinds performed for the current stream.
    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Encoded segment `index`, ready for the transport.
    pub fn frame(&self, index: usize) -> &[u8] {
        &self.frames[index]
    }

    /// Claim every segment the window currently allows, stamping each with
    /// `now`.  The caller transmits `frame(i)` for each returned index.
    pub fn take_sendable(&mut self, now: Instant) -> Range<usize> {
        if self.finished {
            return self.last_sent..self.last_sent;
        }
        let window = usize::from(self.peer_window.max(1));
        let room = window.saturating_sub(self.in_flight());
        let left = self.frames.len() - self.last_sent;
        let start = self.last_sent;
        let end = start + room.min(left);
        for index in start..end {
            self.send_times.insert(index, now);
        }
        self.last_sent = end;
        start..end
    }

    /// Forget timers of acknowledged segments.
    pub fn prune(&mut self) {
        self.send_times = self.send_times.split_off(&self.last_acked);
    }

    /// Instant at which the oldest in-flight segment times out.
    pub fn next_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.send_times.values().next().map(|sent| *sent + timeout)
    }

    /// Go back N if the oldest in-flight segment has been out longer than
    /// `timeout`.  Returns `true` when the window was rewound.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration) -> bool {
        match self.next_deadline(timeout) {
            Some(deadline) if now > deadline => {
                self.stalled_rounds += 1;
                self.go_back_n();
                true
            }
            _ => false,
        }
    }

    fn go_back_n(&mut self) {
        self.send_times.clear();
        self.last_sent = self.last_acked;
        self.retransmissions += 1;
    }

    /// Translate an ACK number to the index it acknowledges up to.
    ///
    /// `None` means the number is not a segment boundary of this stream.
    fn index_of(&self, ack_n: u16) -> Option<usize> {
        // Sequence numbers repeat once a stream passes the modulus; prefer a
        // match inside the window before looking at the whole stream.
        let hi = self.last_sent.min(self.seq_ns.len() - 1);
        let lo = self.last_acked.min(hi);
        self.seq_ns[lo..=hi]
            .iter()
            .position(|&s| s == ack_n)
            .map(|p| p + lo)
            .or_else(|| self.seq_ns.iter().position(|&s| s == ack_n))
    }

    fn finish(&mut self) -> AckOutcome {
        self.finished = true;
        self.last_acked = self.frames.len();
        self.last_sent = self.frames.len();
        self.send_times.clear();
        self.duplicates = 0;
        AckOutcome::Finished
    }

    /// Process a cumulative ACK carrying `seq_n` and `ack_n`.
    ///
    /// The end-of-stream ACK is recognised by both numbers.  An `ack_n` that
    /// is no segment boundary is likewise taken as acknowledging the end of
    /// the stream.  Any ACK at all shows the peer is alive, so it clears the
    /// stall counter even when the window did not move.
    pub fn on_ack(&mut self, seq_n: u16, ack_n: u16) -> AckOutcome {
        if self.frames.is_empty() {
            return AckOutcome::Idle;
        }
        if self.finished {
            return AckOutcome::Stale;
        }
        self.stalled_rounds = 0;

        if seq_n == self.final_echo && ack_n == self.final_ack {
            return self.finish();
        }
        let Some(index) = self.index_of(ack_n) else {
            return self.finish();
        };

        let already_fast = self.fast_retransmitted.is_some_and(|k| k >= index);
        if index == self.last_acked && !already_fast {
            self.duplicates += 1;
            if self.duplicates >= DUP_ACK_THRESHOLD {
                self.duplicates = 0;
                self.fast_retransmitted = Some(index);
                self.go_back_n();
                return AckOutcome::FastRetransmit { index };
            }
            return AckOutcome::Duplicate {
                count: self.duplicates,
            };
        }

        self.duplicates = 0;
        if index > self.last_acked {
            self.last_acked = index;
            // A late ACK may cover segments a rewind already un-sent.
            self.last_sent = self.last_sent.max(index);
            AckOutcome::Advanced { last_acked: index }
        } else {
            AckOutcome::Stale
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Flags;

    const MS: Duration = Duration::from_millis(1);

    /// ACK number the receiver sends after accepting segments `0..=i`.
    fn ack_for(w: &SendWindow, i: usize) -> u16 {
        w.seq_ns[i + 1]
    }

    /// Feed the receiver's ACK for segments `0..=i`.  For data segments the
    /// echoed `seq_n` equals the ACK number.
    fn ack_through(w: &mut SendWindow, i: usize) -> AckOutcome {
        let ack = ack_for(w, i);
        w.on_ack(ack, ack)
    }

    fn ack_final(w: &mut SendWindow) -> AckOutcome {
        let (echo, ack) = (w.final_echo, w.final_ack);
        w.on_ack(echo, ack)
    }

    fn loaded(bytes: usize, peer_window: u8) -> SendWindow {
        let mut w = SendWindow::new(peer_window);
        w.load(&vec![0xab; bytes], 8);
        w
    }

    #[test]
    fn segments_carry_offset_sequence_numbers() {
        let segs = build_segments(&[1u8; 2500], 7);
        assert_eq!(segs.len(), 4);
        assert_eq!((segs[0].seq_n, segs[0].ack_n, segs[0].data_length), (0, 1008, 1008));
        assert_eq!((segs[1].seq_n, segs[1].ack_n), (1008, 2016));
        assert_eq!((segs[2].seq_n, segs[2].ack_n, segs[2].data_length), (2016, 2500, 484));
        assert!(segs[3].is_end_of_stream());
        assert_eq!((segs[3].seq_n, segs[3].ack_n), (2500, 3508));
        assert!(segs.iter().all(|s| s.flags == Flags::NONE && s.window == 7));
    }

    #[test]
    fn empty_input_is_just_end_of_stream() {
        let segs = build_segments(&[], 1);
        assert_eq!(segs.len(), 1);
        assert!(segs[0].is_end_of_stream());
        assert_eq!(segs[0].seq_n, 0);
    }

    #[test]
    fn sequence_numbers_wrap_at_modulus() {
        let segs = build_segments(&vec![0u8; 70_000], 1);
        // Chunk 65 starts at byte 65520; chunk 66 at 66528 -> 993.
        assert_eq!(segs[65].seq_n, 65520);
        assert_eq!(segs[65].ack_n, 993);
        assert_eq!(segs[66].seq_n, 993);
    }

    #[test]
    fn never_exceeds_advertised_window() {
        let mut w = loaded(10 * MAX_PAYLOAD, 3);
        let now = Instant::now();
        assert_eq!(w.take_sendable(now), 0..3);
        assert_eq!(w.in_flight(), 3);
        assert_eq!(w.take_sendable(now), 3..3);

        assert_eq!(ack_through(&mut w, 0), AckOutcome::Advanced { last_acked: 1 });
        assert_eq!(w.take_sendable(now), 3..4);
        assert_eq!(w.in_flight(), 3);

        // Receiver buffer filling up shrinks the window below what is out.
        w.set_peer_window(1);
        assert_eq!(w.take_sendable(now), 4..4);
        assert!(w.in_flight() > usize::from(w.peer_window()));
        ack_through(&mut w, 3);
        assert_eq!(w.in_flight(), 0);
        assert_eq!(w.take_sendable(now), 4..5);
    }

    #[test]
    fn zero_window_still_probes_with_one_segment() {
        let mut w = loaded(3 * MAX_PAYLOAD, 0);
        assert_eq!(w.take_sendable(Instant::now()), 0..1);
        assert_eq!(w.take_sendable(Instant::now()), 1..1);
    }

    #[test]
    fn timeout_goes_back_n() {
        let mut w = loaded(5 * MAX_PAYLOAD, 4);
        let t0 = Instant::now();
        w.take_sendable(t0);
        ack_through(&mut w, 0);
        w.prune();

        assert!(!w.check_timeout(t0 + 50 * MS, 100 * MS));
        assert!(w.check_timeout(t0 + 101 * MS, 100 * MS));
        assert_eq!(w.last_sent(), 1);
        assert_eq!(w.last_acked(), 1);
        assert_eq!(w.retransmissions(), 1);
        assert_eq!(w.next_deadline(100 * MS), None);

        // Everything from the oldest unacknowledged segment goes out again.
        assert_eq!(w.take_sendable(t0 + 101 * MS), 1..5);
    }

    #[test]
    fn prune_keeps_oldest_unacked_timer() {
        let mut w = loaded(3 * MAX_PAYLOAD, 4);
        let t0 = Instant::now();
        w.take_sendable(t0);
        ack_through(&mut w, 0);
        w.prune();
        // Segment 1 is the oldest unacked; its timer must survive pruning.
        assert_eq!(w.next_deadline(10 * MS), Some(t0 + 10 * MS));
        assert_eq!(w.send_times.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn single_segment_in_flight_still_times_out() {
        let mut w = loaded(0, 4);
        let t0 = Instant::now();
        assert_eq!(w.take_sendable(t0), 0..1);
        w.prune();
        assert!(w.check_timeout(t0 + 20 * MS, 10 * MS));
    }

    #[test]
    fn triple_duplicate_ack_fast_retransmits_once_per_index() {
        let mut w = loaded(8 * MAX_PAYLOAD, 8);
        let now = Instant::now();
        w.take_sendable(now);
        let ack = ack_for(&w, 1); // segment 2 was lost
        assert_eq!(w.on_ack(ack, ack), AckOutcome::Advanced { last_acked: 2 });
        assert_eq!(w.on_ack(ack, ack), AckOutcome::Duplicate { count: 1 });
        assert_eq!(w.on_ack(ack, ack), AckOutcome::Duplicate { count: 2 });
        assert_eq!(w.on_ack(ack, ack), AckOutcome::FastRetransmit { index: 2 });
        assert_eq!(w.last_sent(), 2);
        assert_eq!(w.retransmissions(), 1);

        // Further duplicates for the same index must not retrigger.
        for _ in 0..6 {
            assert_eq!(w.on_ack(ack, ack), AckOutcome::Stale);
        }
        assert_eq!(w.retransmissions(), 1);

        // Without waiting for any timeout the window is refilled.
        assert_eq!(w.take_sendable(now), 2..9);
    }

    #[test]
    fn late_ack_after_rewind_keeps_indices_ordered() {
        let mut w = loaded(6 * MAX_PAYLOAD, 6);
        let t0 = Instant::now();
        w.take_sendable(t0);
        assert!(w.check_timeout(t0 + 20 * MS, 10 * MS));
        assert_eq!(w.last_sent(), 0);

        // ACK from the first round arrives after the rewind.
        ack_through(&mut w, 3);
        assert_eq!(w.last_acked(), 4);
        assert_eq!(w.last_sent(), 4);
        assert_eq!(w.in_flight(), 0);
    }

    #[test]
    fn end_of_stream_ack_finishes() {
        let mut w = loaded(2 * MAX_PAYLOAD, 8);
        w.take_sendable(Instant::now());
        assert_eq!(w.len(), 3);
        assert_eq!(ack_through(&mut w, 1), AckOutcome::Advanced { last_acked: 2 });
        assert!(w.is_active());
        assert_eq!(ack_final(&mut w), AckOutcome::Finished);
        assert!(w.is_finished());
        assert!(!w.is_active());
        assert_eq!(ack_final(&mut w), AckOutcome::Stale);
    }

    #[test]
    fn unknown_ack_number_is_treated_as_final() {
        let mut w = loaded(MAX_PAYLOAD, 8);
        w.take_sendable(Instant::now());
        assert_eq!(w.on_ack(12345, 12345), AckOutcome::Finished);
    }

    #[test]
    fn one_byte_tail_does_not_end_stream_early() {
        // 1009 bytes: the final ACK number (1008) is also the data ACK for
        // segment 0.  Only the echoed seq_n tells them apart.
        let mut w = SendWindow::new(4);
        w.load(&[7; 1009], 4);
        assert_eq!(w.take_sendable(Instant::now()), 0..3);
        assert_eq!(w.final_ack, 1008);

        assert_eq!(w.on_ack(1008, 1008), AckOutcome::Advanced { last_acked: 1 });
        assert_eq!(w.on_ack(1008, 1008), AckOutcome::Duplicate { count: 1 });
        assert!(!w.is_finished());
        assert_eq!(ack_final(&mut w), AckOutcome::Finished);
    }

    #[test]
    fn any_ack_clears_stall_counter() {
        let mut w = loaded(4 * MAX_PAYLOAD, 1);
        let t0 = Instant::now();
        w.take_sendable(t0);
        assert!(w.check_timeout(t0 + 20 * MS, 10 * MS));
        assert_eq!(w.stalled_rounds(), 1);

        // Zero-window answer to the retransmission: a duplicate of the last ACK.
        w.set_peer_window(0);
        assert_eq!(w.on_ack(0, 0), AckOutcome::Duplicate { count: 1 });
        assert_eq!(w.stalled_rounds(), 0);
    }

    #[test]
    fn idle_window_ignores_acks() {
        let mut w = SendWindow::new(4);
        assert_eq!(w.on_ack(0, 0), AckOutcome::Idle);
        assert!(!w.is_active());
    }

    #[test]
    fn progress_resets_stall_counter() {
        let mut w = loaded(4 * MAX_PAYLOAD, 4);
        let t0 = Instant::now();
        w.take_sendable(t0);
        assert!(w.check_timeout(t0 + 20 * MS, 10 * MS));
        w.take_sendable(t0 + 20 * MS);
        assert!(w.check_timeout(t0 + 40 * MS, 10 * MS));
        assert_eq!(w.stalled_rounds(), 2);
        ack_through(&mut w, 0);
        assert_eq!(w.stalled_rounds(), 0);
    }
}
