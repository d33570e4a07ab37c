use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reasons a received frame or PDU was dropped without reaching a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Checksum,
    OutOfOrder,
    Malformed,
    UnknownPduType,
    VersionMismatch,
    ReassemblyTimeout,
}

impl DropReason {
    pub const ALL: [DropReason; 6] = [
        DropReason::Checksum,
        DropReason::OutOfOrder,
        DropReason::Malformed,
        DropReason::UnknownPduType,
        DropReason::VersionMismatch,
        DropReason::ReassemblyTimeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Checksum => "checksum",
            DropReason::OutOfOrder => "out_of_order",
            DropReason::Malformed => "malformed",
            DropReason::UnknownPduType => "unknown_pdu_type",
            DropReason::VersionMismatch => "version_mismatch",
            DropReason::ReassemblyTimeout => "reassembly_timeout",
        }
    }

    fn index(self) -> usize {
        match self {
            DropReason::Checksum => 0,
            DropReason::OutOfOrder => 1,
            DropReason::Malformed => 2,
            DropReason::UnknownPduType => 3,
            DropReason::VersionMismatch => 4,
            DropReason::ReassemblyTimeout => 5,
        }
    }
}

/// Rolling counters for the daemon. Shared across the engine and the
/// per-interface reader tasks.
pub struct Metrics {
    pub frames_rx: AtomicU64,
    pub frames_tx: AtomicU64,
    pub pdus_rx: AtomicU64,
    pub pdus_tx: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_established: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub northbound_pushes: AtomicU64,
    drops: [AtomicU64; DropReason::ALL.len()],
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_rx: AtomicU64::new(0),
            frames_tx: AtomicU64::new(0),
            pdus_rx: AtomicU64::new(0),
            pdus_tx: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_established: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            northbound_pushes: AtomicU64::new(0),
            drops: Default::default(),
        })
    }

    pub fn inc_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    /// One-line summary of drop counters for the periodic log.
    pub fn drop_summary(&self) -> String {
        DropReason::ALL
            .iter()
            .map(|r| format!("{}={}", r.as_str(), self.drop_count(*r)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
