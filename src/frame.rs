//! Transport layer: the 8-byte frame header, per-frame CRC-32, outbound
//! fragmentation, and lock-step inbound reassembly.
//!
//! A PDU is carried as 1..=128 frames. Every frame repeats the total PDU
//! length; the payload checksum covers that frame's payload only. Reassembly
//! is strictly in-order per peer: there is at most one in-flight PDU per
//! direction, so any sequence violation resets the buffer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::metrics::DropReason;
use crate::wire::{MacAddr, LSOE_VERSION};

/// Frame header size: version(1) + L/seq(1) + length(2) + checksum(4).
pub const FRAME_HDR_LEN: usize = 8;

/// Last-frame flag in the L/sequence octet.
pub const FRAME_LAST_FLAG: u8 = 0x80;

/// Sequence numbers are 7 bits wide.
pub const MAX_FRAMES_PER_PDU: usize = 128;

/// (local interface index, peer MAC): the unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub ifindex: u32,
    pub mac: MacAddr,
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "if{}/{}", self.ifindex, self.mac)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub last: bool,
    pub seq: u8,
    /// Total length of the PDU this frame belongs to.
    pub pdu_len: u16,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<FrameHeader, ProtocolError> {
        if buf.len() < FRAME_HDR_LEN {
            return Err(ProtocolError::malformed("frame shorter than header"));
        }
        let flags_seq = buf[1];
        Ok(FrameHeader {
            version: buf[0],
            last: flags_seq & FRAME_LAST_FLAG != 0,
            seq: flags_seq & !FRAME_LAST_FLAG,
            pdu_len: u16::from_be_bytes([buf[2], buf[3]]),
            checksum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HDR_LEN] {
        let mut flags_seq = self.seq & !FRAME_LAST_FLAG;
        if self.last {
            flags_seq |= FRAME_LAST_FLAG;
        }
        let len = self.pdu_len.to_be_bytes();
        let sum = self.checksum.to_be_bytes();
        [
            self.version,
            flags_seq,
            len[0],
            len[1],
            sum[0],
            sum[1],
            sum[2],
            sum[3],
        ]
    }
}

/// Split an encoded PDU into transport frames no larger than `mtu`.
pub fn fragment(pdu: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    if mtu <= FRAME_HDR_LEN {
        return Err(ProtocolError::malformed(format!(
            "MTU {mtu} leaves no room for payload"
        )));
    }
    if pdu.len() > u16::MAX as usize {
        return Err(ProtocolError::malformed("PDU exceeds length field"));
    }
    let chunk = mtu - FRAME_HDR_LEN;
    let count = pdu.len().div_ceil(chunk).max(1);
    if count > MAX_FRAMES_PER_PDU {
        return Err(ProtocolError::malformed(format!(
            "PDU needs {count} frames, limit is {MAX_FRAMES_PER_PDU}"
        )));
    }

    let mut frames = Vec::with_capacity(count);
    for (i, payload) in pdu.chunks(chunk).enumerate() {
        let header = FrameHeader {
            version: LSOE_VERSION,
            last: i == count - 1,
            seq: i as u8,
            pdu_len: pdu.len() as u16,
            checksum: crc32fast::hash(payload),
        };
        let mut frame = Vec::with_capacity(FRAME_HDR_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        frames.push(frame);
    }
    if frames.is_empty() {
        // Zero-length PDU still travels as one empty last frame.
        let header = FrameHeader {
            version: LSOE_VERSION,
            last: true,
            seq: 0,
            pdu_len: 0,
            checksum: crc32fast::hash(&[]),
        };
        frames.push(header.encode().to_vec());
    }
    Ok(frames)
}

/// Outcome of feeding one received frame to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    /// A full PDU completed; hand it to the session layer.
    Complete(Vec<u8>),
    /// Frame accepted, PDU not yet complete.
    Pending,
    /// Frame discarded; counted under the given reason.
    Dropped(DropReason),
}

struct ReassemblyBuffer {
    next_seq: u8,
    pdu_len: u16,
    payload: Vec<u8>,
    last_progress: Instant,
}

/// Per-peer lock-step reassembly of multi-frame PDUs.
pub struct Reassembler {
    buffers: HashMap<PeerKey, ReassemblyBuffer>,
    ttl: Duration,
}

impl Reassembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl,
        }
    }

    /// Feed one frame received from `key`. `now` is supplied by the caller
    /// so timeout behavior is testable.
    pub fn feed(&mut self, key: PeerKey, frame: &[u8], now: Instant) -> FeedOutcome {
        let header = match FrameHeader::decode(frame) {
            Ok(h) => h,
            Err(_) => return FeedOutcome::Dropped(DropReason::Malformed),
        };
        if header.version != LSOE_VERSION {
            return FeedOutcome::Dropped(DropReason::VersionMismatch);
        }
        let payload = &frame[FRAME_HDR_LEN..];
        if crc32fast::hash(payload) != header.checksum {
            return FeedOutcome::Dropped(DropReason::Checksum);
        }

        let expected = self.buffers.get(&key).map(|b| b.next_seq).unwrap_or(0);
        if header.seq != expected
            || self
                .buffers
                .get(&key)
                .is_some_and(|b| b.pdu_len != header.pdu_len)
        {
            // Lock-step broken: reset. A fresh sequence 0 starts the next
            // PDU immediately so a full retransmission is not wasted.
            self.buffers.remove(&key);
            if header.seq != 0 {
                return FeedOutcome::Dropped(DropReason::OutOfOrder);
            }
        }

        let buffer = self.buffers.entry(key).or_insert_with(|| ReassemblyBuffer {
            next_seq: 0,
            pdu_len: header.pdu_len,
            payload: Vec::with_capacity(header.pdu_len as usize),
            last_progress: now,
        });
        buffer.payload.extend_from_slice(payload);
        buffer.next_seq = header.seq + 1;
        buffer.last_progress = now;

        if !header.last {
            if buffer.payload.len() >= header.pdu_len as usize {
                // More payload than the declared total with frames still
                // outstanding; the stream is corrupt.
                self.buffers.remove(&key);
                return FeedOutcome::Dropped(DropReason::Malformed);
            }
            return FeedOutcome::Pending;
        }

        let buffer = self.buffers.remove(&key).unwrap();
        if buffer.payload.len() != header.pdu_len as usize {
            return FeedOutcome::Dropped(DropReason::Malformed);
        }
        FeedOutcome::Complete(buffer.payload)
    }

    /// Discard buffers with no progress for the reassembly TTL. Returns the
    /// number discarded.
    pub fn gc(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        let ttl = self.ttl;
        self.buffers
            .retain(|_, b| now.duration_since(b.last_progress) < ttl);
        before - self.buffers.len()
    }

    /// Drop any partial state for a departed peer.
    pub fn forget(&mut self, key: PeerKey) {
        self.buffers.remove(&key);
    }

    /// Earliest instant at which [`gc`](Self::gc) would discard something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers
            .values()
            .map(|b| b.last_progress + self.ttl)
            .min()
    }
}
