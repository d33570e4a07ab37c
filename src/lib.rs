pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod netio;
pub mod netmon;
pub mod northbound;
pub mod session;
pub mod wire;

// Re-export key types for easier access by consumers
pub use config::Config;
pub use engine::{Engine, Event};
pub use error::ProtocolError;
pub use frame::{FeedOutcome, FrameHeader, PeerKey, Reassembler};
pub use metrics::{DropReason, Metrics};
pub use netio::{EtherSocket, MacCache};
pub use netmon::{AddrScope, IfAddr, Iface, MonitorEvent};
pub use northbound::{HttpReporter, LogReporter, Reporter, Snapshot};
pub use session::{
    CloseReason, Session, SessionConfig, SessionInfo, SessionState, VendorDecision,
    VendorHandler, VendorRegistry,
};
pub use wire::{MacAddr, Pdu, PduType};
