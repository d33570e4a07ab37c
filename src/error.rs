//! Error types for the LSOE protocol engine.

use thiserror::Error;

/// All errors the protocol engine can produce.
///
/// Recovery policy lives with the caller: checksum, ordering, and
/// reassembly errors are dropped and counted; malformed/version errors are
/// surfaced to the peer as ERROR PDUs; link and liveness errors terminate
/// the affected session.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// PDU failed structural validation during decode.
    #[error("malformed PDU: {0}")]
    Malformed(String),

    /// Transport frame checksum did not verify.
    #[error("frame checksum mismatch")]
    ChecksumFailure,

    /// Frame sequence number broke the lock-step reassembly order.
    #[error("frame out of order")]
    OutOfOrder,

    /// PDU type octet not assigned by the protocol.
    #[error("unknown PDU type {0}")]
    UnknownPduType(u8),

    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: got {0}")]
    VersionMismatch(u8),

    /// Interface disappeared underneath a send.
    #[error("link down")]
    LinkDown,

    /// Nothing heard from the peer within the hold time.
    #[error("keepalive timeout")]
    KeepaliveTimeout,

    /// An acknowledgeable PDU ran out of retransmit attempts.
    #[error("retransmit attempts exhausted")]
    RetransmitExhausted,

    /// Multi-frame PDU never completed within the reassembly TTL.
    #[error("reassembly timeout")]
    ReassemblyTimeout,

    /// Invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ProtocolError::Malformed(msg.into())
    }
}
