//! Wire-format definitions for bTCP segments.
//!
//! Every datagram exchanged between peers is exactly one [`Segment`] of
//! [`SEGMENT_LEN`] bytes, whatever its payload length.  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload slot).
//! - Serialising a [`Segment`] into a fixed-size buffer with its checksum.
//! - Deserialising a raw buffer back into a [`Segment`], rejecting buffers of
//!   the wrong size.
//! - The checksum used to detect corruption.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Acknowledgment Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |    Window     |          Data Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
//! |                 Payload slot (1008 bytes) ...                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The window field is a single byte, so an advertised window can never
//! exceed 255 segments.

use std::fmt;
use std::ops::BitOr;

use rand::Rng;
use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 10;

/// Size of the payload slot carried by every segment.
pub const MAX_PAYLOAD: usize = 1008;

/// Total size of one segment on the wire.
pub const SEGMENT_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

/// `data_length` value marking the zero-payload end-of-stream segment.
pub const END_OF_STREAM: u16 = 65534;

/// Modulus of the sequence space.
///
/// Note this is 65535, not 65536: the value is part of the wire behaviour
/// (it decides where sequence numbers wrap) and both peers must agree on it.
pub const SEQ_MODULUS: usize = 65535;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 2;
const OFF_FLAGS: usize = 4;
const OFF_WINDOW: usize = 5;
const OFF_DATA_LEN: usize = 6;
const OFF_CHECKSUM: usize = 8;

/// Reduce a byte offset into the sequence space.
#[inline]
pub fn wrap_seq(n: usize) -> u16 {
    (n % SEQ_MODULUS) as u16
}

/// Fresh random sequence number in `[0, 65535)`, for SYN and SYN+ACK.
pub fn random_seq() -> u16 {
    rand::rng().random_range(0..SEQ_MODULUS as u16)
}

/// Set of control flags carried in the flags byte.
///
/// Only the low three bits are meaningful; anything above them is dropped
/// when decoding.  An empty set marks a plain data segment.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// Plain data segment.
    pub const NONE: Flags = Flags(0);
    /// Finish: the sender wants to tear the connection down.
    pub const FIN: Flags = Flags(0b001);
    /// Synchronise: connection establishment.
    pub const SYN: Flags = Flags(0b010);
    /// Acknowledgement number is meaningful.
    pub const ACK: Flags = Flags(0b100);

    const MASK: u8 = 0b111;

    /// Decode a flags byte into the subset of flags its bits indicate.
    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & Self::MASK)
    }

    /// Encode the set back into its wire byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("DATA");
        }
        let names = [(Flags::SYN, "SYN"), (Flags::ACK, "ACK"), (Flags::FIN, "FIN")];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One bTCP segment.
///
/// `payload` holds the meaningful bytes only; the padding up to
/// [`MAX_PAYLOAD`] exists on the wire alone.  For the end-of-stream segment
/// `data_length` is [`END_OF_STREAM`] and `payload` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq_n: u16,
    pub ack_n: u16,
    pub flags: Flags,
    /// Advertised receive window, in segments.
    pub window: u8,
    pub data_length: u16,
    /// Checksum as found on the wire; ignored by [`Segment::encode`].
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    fn control(seq_n: u16, ack_n: u16, flags: Flags, window: u8) -> Self {
        Self {
            seq_n,
            ack_n,
            flags,
            window,
            data_length: 0,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    /// Connection request with the client's initial sequence number.
    pub fn syn(seq_n: u16, window: u8) -> Self {
        Self::control(seq_n, 0, Flags::SYN, window)
    }

    pub fn syn_ack(seq_n: u16, ack_n: u16, window: u8) -> Self {
        Self::control(seq_n, ack_n, Flags::SYN | Flags::ACK, window)
    }

    pub fn ack(seq_n: u16, ack_n: u16, window: u8) -> Self {
        Self::control(seq_n, ack_n, Flags::ACK, window)
    }

    pub fn fin(seq_n: u16, window: u8) -> Self {
        Self::control(seq_n, 0, Flags::FIN, window)
    }

    pub fn fin_ack(window: u8) -> Self {
        Self::control(0, 0, Flags::FIN | Flags::ACK, window)
    }

    /// Plain data segment.  Payloads longer than [`MAX_PAYLOAD`] are truncated.
    pub fn data(seq_n: u16, ack_n: u16, window: u8, payload: &[u8]) -> Self {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
        Self {
            seq_n,
            ack_n,
            flags: Flags::NONE,
            window,
            data_length: payload.len() as u16,
            checksum: 0,
            payload: payload.to_vec(),
        }
    }

    /// Zero-payload segment closing a data stream.
    pub fn end_of_stream(seq_n: u16, ack_n: u16, window: u8) -> Self {
        Self {
            data_length: END_OF_STREAM,
            ..Self::control(seq_n, ack_n, Flags::NONE, window)
        }
    }

    /// `true` for the segment that closes a data stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.data_length == END_OF_STREAM
    }

    /// Serialise into a [`SEGMENT_LEN`]-byte buffer.
    ///
    /// The checksum is computed over the buffer with the checksum field
    /// zeroed and then written into place; `self.checksum` is not consulted.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SEGMENT_LEN];

        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq_n.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 2].copy_from_slice(&self.ack_n.to_be_bytes());
        buf[OFF_FLAGS] = self.flags.bits();
        buf[OFF_WINDOW] = self.window;
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&self.data_length.to_be_bytes());

        let n = self.payload.len().min(MAX_PAYLOAD);
        buf[HEADER_LEN..HEADER_LEN + n].copy_from_slice(&self.payload[..n]);

        let csum = checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Segment`] from a raw buffer.
    ///
    /// Only the buffer length is validated.  The checksum is carried over
    /// as received; use [`is_intact`] on the same bytes to check it.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() != SEGMENT_LEN {
            return Err(SegmentError::Length {
                expected: SEGMENT_LEN,
                actual: buf.len(),
            });
        }

        let field = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        let data_length = field(OFF_DATA_LEN);
        // Lengths beyond the slot (the end-of-stream sentinel) carry no bytes.
        let n = if usize::from(data_length) <= MAX_PAYLOAD {
            usize::from(data_length)
        } else {
            0
        };

        Ok(Segment {
            seq_n: field(OFF_SEQ),
            ack_n: field(OFF_ACK),
            flags: Flags::from_bits(buf[OFF_FLAGS]),
            window: buf[OFF_WINDOW],
            data_length,
            checksum: field(OFF_CHECKSUM),
            payload: buf[HEADER_LEN..HEADER_LEN + n].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    /// Framing error: every bTCP segment has the same size.
    #[error("segment must be exactly {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Checksum over `data`.
///
/// Consecutive bytes are paired into 16-bit words with the *first* byte as
/// the low half, summed into a 32-bit accumulator, folded until no carry
/// remains, complemented, and finally byte-swapped.  Encoding writes the
/// result big-endian, which makes the checksum of an intact segment
/// (checksum field included) come out as exactly zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for pair in &mut words {
        sum = sum.wrapping_add(u32::from(u16::from_le_bytes([pair[0], pair[1]])));
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u32::from(*last));
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    (!sum as u16).swap_bytes()
}

/// `true` when `buf` (as received, checksum field included) checks out.
pub fn is_intact(buf: &[u8]) -> bool {
    checksum(buf) == 0
}
