//! Go-Back-N receive-side state machine.
//!
//! [`Receiver`] implements the receiver side of the protocol:
//!
//! - Only **in-order** segments are accepted: the very first segment must
//!   carry sequence number 0, every later one the next-expected number this
//!   side last acknowledged.
//! - Out-of-order or duplicate segments are discarded and answered with a
//!   repeat of the last ACK, which is what drives the sender's fast
//!   retransmit.
//! - Accepted payloads go into the bounded [`ReceiveBuffer`]; the free space
//!   left in it is the window advertised in every ACK.
//!
//! This module only manages state; sending the returned ACKs is the
//! caller's responsibility.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::segment::{wrap_seq, Segment};

// ---------------------------------------------------------------------------
// ReceiveBuffer
// ---------------------------------------------------------------------------

/// Bounded FIFO of payload chunks between the inbound handler (producer) and
/// the application (consumer).
///
/// `try_push` never blocks: when the buffer is full the chunk is handed back
/// and the sender learns about it through the advertised window.
#[derive(Debug)]
pub struct ReceiveBuffer {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    notify: Notify,
}

impl ReceiveBuffer {
    pub fn new(capacity: u8) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(usize::from(capacity))),
            capacity: usize::from(capacity),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `chunk`, or give it back if the buffer is full.
    pub fn try_push(&self, chunk: Vec<u8>) -> Result<(), Vec<u8>> {
        {
            let mut chunks = self.lock();
            if chunks.len() >= self.capacity {
                return Err(chunk);
            }
            chunks.push_back(chunk);
        }
        self.wake();
        Ok(())
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Chunks that still fit; this is the advertised window.
    pub fn free(&self) -> u8 {
        // capacity came from a u8, so the difference fits.
        self.capacity.saturating_sub(self.len()) as u8
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.wake();
    }

    /// Future resolving on the next [`wake`](Self::wake).  Create it *before*
    /// checking the buffer so a push in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every task waiting for data or for the stream to end.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// What became of one inbound data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Payload queued for the application.
    Accepted,
    /// End-of-stream segment accepted.
    EndOfStream,
    /// Not the expected sequence number.
    OutOfOrder,
    /// In order, but the buffer had no room.
    BufferFull,
}

/// Result of [`Receiver::on_data`]: the verdict and the ACK to send, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReply {
    pub verdict: Verdict,
    pub ack: Option<Segment>,
}

/// Receive-side state for one connection.
#[derive(Debug, Default)]
pub struct Receiver {
    /// Next expected sequence number; `None` until the first segment.
    last_sent_ack_n: Option<u16>,
    /// `(seq_n, ack_n)` of the last ACK sent, for duplicate ACKs.
    last_ack: Option<(u16, u16)>,
    finished: bool,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number this side will accept.
    pub fn expected(&self) -> Option<u16> {
        self.last_sent_ack_n
    }

    /// `true` once the end-of-stream segment has been accepted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn in_order(&self, seq_n: u16) -> bool {
        match self.last_sent_ack_n {
            None => seq_n == 0,
            Some(expected) => seq_n == expected,
        }
    }

    fn repeat_ack(&self, buffer: &ReceiveBuffer) -> Option<Segment> {
        self.last_ack
            .map(|(seq_n, ack_n)| Segment::ack(seq_n, ack_n, buffer.free()))
    }

    /// Process one plain data segment.
    ///
    /// The returned ACK always advertises the buffer's current free space.
    pub fn on_data(&mut self, segment: &Segment, buffer: &ReceiveBuffer) -> DataReply {
        if !self.in_order(segment.seq_n) {
            return DataReply {
                verdict: Verdict::OutOfOrder,
                ack: self.repeat_ack(buffer),
            };
        }

        let verdict = if segment.is_end_of_stream() {
            Verdict::EndOfStream
        } else {
            let n = usize::from(segment.data_length).min(segment.payload.len());
            if n > 0 && buffer.try_push(segment.payload[..n].to_vec()).is_err() {
                return DataReply {
                    verdict: Verdict::BufferFull,
                    ack: self.repeat_ack(buffer),
                };
            }
            Verdict::Accepted
        };

        let next = wrap_seq(usize::from(segment.seq_n) + usize::from(segment.data_length));
        self.last_sent_ack_n = Some(next);
        self.last_ack = Some((segment.ack_n, next));
        if verdict == Verdict::EndOfStream {
            self.finished = true;
            buffer.wake();
        }

        DataReply {
            verdict,
            ack: Some(Segment::ack(segment.ack_n, next, buffer.free())),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
