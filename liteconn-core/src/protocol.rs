//! LiteConn wire types, flags, and sequence utilities
//!
//! All multi-byte integers are big-endian on the wire.
//!
//! ```text
//!  0       4       8   9       13              21
//!  +-------+-------+---+-------+---------------+----------
//!  |session| index |flg| id32  |     id64      | payload
//!  +-------+-------+---+-------+---------------+----------
//! ```

use crate::error::{CoreError, CoreResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Negotiated session identifier (0 = not yet assigned)
pub type SessionId = u32;

/// Per-connection transport sequence number
pub type PacketIndex = u32;

/// Reliability id, fresh for every reliably-sent datagram
pub type ReliabilityId = u32;

/// Correlation id, stable across a request/response exchange
pub type CorrelationId = u64;

/// Generate a random non-zero nonce using OS-entropy-seeded hashing.
/// 0 is reserved for "no session" in the initial SYN.
pub fn random_nonce() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    loop {
        let id = RandomState::new().build_hasher().finish() as u32;
        if id != 0 {
            return id;
        }
    }
}

// ── Flags ───────────────────────────────────────────────────────────────

/// Bit-independent header flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// Datagram carries an application payload
    pub const DATA: Flags = Flags(0x01);
    /// Acknowledgement (delivery ack, handshake ack, or reply direction)
    pub const ACK: Flags = Flags(0x02);
    /// Payload is a request awaiting a reply
    pub const REQ: Flags = Flags(0x04);
    /// Cancellation / rejection of a correlated exchange
    pub const CXL: Flags = Flags(0x08);
    /// Reliable: must be acknowledged by `id32`
    pub const IMP: Flags = Flags(0x10);
    /// Handshake (protocol-internal)
    pub const SYN: Flags = Flags(0x20);
    /// Graceful close (protocol-internal)
    pub const FIN: Flags = Flags(0x40);
    /// Heartbeat (protocol-internal)
    pub const HBT: Flags = Flags(0x80);

    const NAMES: [(Flags, &'static str); 8] = [
        (Self::DATA, "DATA"),
        (Self::ACK, "ACK"),
        (Self::REQ, "REQ"),
        (Self::CXL, "CXL"),
        (Self::IMP, "IMP"),
        (Self::SYN, "SYN"),
        (Self::FIN, "FIN"),
        (Self::HBT, "HBT"),
    ];

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one bit of `other` is set
    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }

    /// Check the flag combination against the set the protocol can produce.
    ///
    /// Datagrams failing this check are discarded before they touch any
    /// connection state.
    pub fn is_well_formed(self) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.contains(Self::SYN) {
            return self == Self::SYN || self == Self::SYN | Self::ACK;
        }
        if self.contains(Self::FIN) {
            return self == Self::FIN;
        }
        if self.contains(Self::HBT) {
            return self == Self::HBT || self == Self::HBT | Self::ACK;
        }
        if self.contains(Self::REQ) && !self.contains(Self::DATA) {
            return false;
        }
        if self.contains(Self::CXL) && self.intersects(Self::DATA | Self::REQ) {
            return false;
        }
        if self.contains(Self::IMP) && !self.intersects(Self::DATA | Self::CXL) {
            return false;
        }
        true
    }

    /// Pure delivery acknowledgement (no payload, no correlation meaning)
    pub fn is_bare_ack(self) -> bool {
        self == Self::ACK
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
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

// ── Header ──────────────────────────────────────────────────────────────

/// Fixed-size envelope prefixed to every LiteConn datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub session_id: SessionId,
    pub index: PacketIndex,
    pub flags: Flags,
    pub id32: ReliabilityId,
    pub id64: CorrelationId,
}

impl Header {
    /// Size of the header in bytes
    pub const SIZE: usize = 21;

    /// Create a header with zeroed index and ids
    pub fn new(session_id: SessionId, flags: Flags) -> Self {
        Self {
            session_id,
            index: 0,
            flags,
            id32: 0,
            id64: 0,
        }
    }

    pub fn with_id32(mut self, id32: ReliabilityId) -> Self {
        self.id32 = id32;
        self
    }

    pub fn with_id64(mut self, id64: CorrelationId) -> Self {
        self.id64 = id64;
        self
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.session_id);
        buf.put_u32(self.index);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.id32);
        buf.put_u64(self.id64);
    }

    /// Decode header from the front of `buf`, advancing past it.
    ///
    /// Returns `None` when fewer than [`Header::SIZE`] bytes remain.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        Some(Self {
            session_id: buf.get_u32(),
            index: buf.get_u32(),
            flags: Flags::from_bits(buf.get_u8()),
            id32: buf.get_u32(),
            id64: buf.get_u64(),
        })
    }

    /// Parse the header of a raw datagram without consuming it
    pub fn peek(datagram: &[u8]) -> Option<Self> {
        let mut view = datagram;
        Self::decode(&mut view)
    }
}

// ── Packet ──────────────────────────────────────────────────────────────

/// Header plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Header-only packet
    pub fn control(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        self.header.encode(buf);
        buf.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Split a datagram into header and payload
    pub fn decode(mut datagram: Bytes) -> Option<Self> {
        let header = Header::decode(&mut datagram)?;
        Some(Self {
            header,
            payload: datagram,
        })
    }

    /// Total encoded size
    pub fn size(&self) -> usize {
        Header::SIZE + self.payload.len()
    }
}

// ── Conversation framing ────────────────────────────────────────────────

/// Bytes taken by the nested correlation id of a conversation reply
pub const CONVERSATION_PREFIX_SIZE: usize = 8;

/// Prefix `data` with the correlation id of the nested request
pub fn encode_conversation(next: CorrelationId, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CONVERSATION_PREFIX_SIZE + data.len());
    buf.put_u64(next);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Strip the nested correlation id from a conversation reply
pub fn split_conversation(mut payload: Bytes) -> CoreResult<(CorrelationId, Bytes)> {
    if payload.len() < CONVERSATION_PREFIX_SIZE {
        return Err(CoreError::protocol(format!(
            "conversation reply of {} bytes has no correlation prefix",
            payload.len()
        )));
    }
    let next = payload.get_u64();
    Ok((next, payload))
}

// ── Statistics ──────────────────────────────────────────────────────────

/// Counters kept by each connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket
    pub datagrams_sent: u64,
    /// Flag-validated datagrams processed
    pub datagrams_received: u64,
    /// Bytes handed to the socket, headers included
    pub bytes_sent: u64,
    /// Bytes received, headers included
    pub bytes_received: u64,
    /// Reliable datagrams sent again after their retry timer expired
    pub retransmissions: u64,
    /// Heartbeats sent while idle
    pub heartbeats_sent: u64,
    /// Reliable duplicates re-acked without re-delivery
    pub duplicates_suppressed: u64,
    /// Reliable deliveries left unacked because the queue was full
    pub deliveries_deferred: u64,
    /// Unreliable datagrams dropped because the queue was full
    pub unreliable_dropped: u64,
    /// Routed datagrams discarded for bad flags or framing
    pub malformed_discarded: u64,
}

// ── Serial arithmetic ───────────────────────────────────────────────────

/// Check if a sequence number is before another (handling wrapping)
pub fn seq_before(seq1: PacketIndex, seq2: PacketIndex) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// `index` is the same as or newer than `reference`.
///
/// Anything up to 2^31 - 1 steps ahead counts as newer, so the comparison
/// stays correct across the `u32::MAX -> 0` wrap.
pub fn index_at_or_after(index: PacketIndex, reference: PacketIndex) -> bool {
    !seq_before(index, reference)
}
