//! Per-peer session: the LSOE state machine, retransmission queue, and the
//! peer's advertised address snapshot.
//!
//! A session is pure protocol state. It never touches a socket: inbound
//! PDUs are fed in by the engine, outbound PDUs accumulate in an outbox the
//! engine drains, and every time-dependent decision takes `now` as an
//! argument. That keeps the whole state machine testable without I/O.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::ProtocolError;
use crate::frame::PeerKey;
use crate::wire::{
    AckPdu, ClosePdu, EncapPdu, ErrorCode, ErrorPdu, KeepalivePdu, MacAddr, MplsEncap, IpEncap,
    OpenPdu, Pdu, PduType, VendorPdu,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OpenSent,
    OpenRcvd,
    Established,
    Closing,
    /// Terminal. No transition is defined out of this state; the engine
    /// reaps the session.
    Closed,
}

/// Why a session ended (or is ending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    LocalClose,
    PeerClose,
    KeepaliveTimeout,
    RetransmitExhausted,
    LinkDown,
    FatalError,
    Shutdown,
}

/// Timer parameters and local identity shared by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_id: [u8; 10],
    pub hold_time: Duration,
    pub keepalive_interval: Duration,
    pub retransmit_base: Duration,
    pub retransmit_cap: Duration,
    pub max_attempts: u32,
}

/// The peer's advertised addresses, replaced atomically per family.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    pub ipv4: Vec<IpEncap>,
    pub ipv6: Vec<IpEncap>,
    pub mpls: Vec<MplsEncap>,
}

/// Read-only session context handed to vendor handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: PeerKey,
    pub state: SessionState,
    pub peer_local_id: Option<[u8; 10]>,
}

/// Verdict from a vendor extension handler.
pub enum VendorDecision {
    Accept,
    Reject { detail: Vec<u8> },
}

/// Handler for VENDOR PDUs of one enterprise number.
pub trait VendorHandler: Send {
    fn handle(&self, pdu: &VendorPdu, session: &SessionInfo) -> VendorDecision;
}

/// Vendor handler table, populated once at engine construction.
#[derive(Default)]
pub struct VendorRegistry {
    handlers: HashMap<u32, Box<dyn VendorHandler>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, enterprise: u32, handler: Box<dyn VendorHandler>) {
        self.handlers.insert(enterprise, handler);
    }

    fn decide(&self, pdu: &VendorPdu, info: &SessionInfo) -> Option<VendorDecision> {
        self.handlers.get(&pdu.enterprise).map(|h| h.handle(pdu, info))
    }
}

struct Inflight {
    pdu: Pdu,
    ack_id: u32,
    next_retry: Instant,
    interval: Duration,
    attempts: u32,
}

pub struct Session {
    pub key: PeerKey,
    cfg: SessionConfig,
    state: SessionState,
    /// Lower MAC initiates the OPEN exchange; on the (never expected) tie
    /// both sides do, which the idempotent exchange tolerates.
    initiator: bool,
    our_nonce: [u8; 4],
    our_open_acked: bool,
    peer_open_seen: bool,
    peer_nonce: Option<[u8; 4]>,
    pub peer_local_id: Option<[u8; 10]>,
    peer_hold_time: Option<Duration>,
    ack_counter: u32,
    inflight: HashMap<PduType, Inflight>,
    deferred: HashMap<PduType, Pdu>,
    pub peer_snapshot: PeerSnapshot,
    last_rx: Instant,
    last_tx: Instant,
    outbox: Vec<Pdu>,
    snapshot_dirty: bool,
    entered_established: bool,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(key: PeerKey, local_mac: MacAddr, cfg: SessionConfig, now: Instant) -> Self {
        let initiator = local_mac <= key.mac;
        debug!(
            "session {key}: created ({})",
            if initiator { "initiator" } else { "responder" }
        );
        Self {
            key,
            cfg,
            state: SessionState::Idle,
            initiator,
            our_nonce: rand::random(),
            our_open_acked: false,
            peer_open_seen: false,
            peer_nonce: None,
            peer_local_id: None,
            peer_hold_time: None,
            ack_counter: 0,
            inflight: HashMap::new(),
            deferred: HashMap::new(),
            peer_snapshot: PeerSnapshot::default(),
            last_rx: now,
            last_tx: now,
            outbox: Vec::new(),
            snapshot_dirty: false,
            entered_established: false,
            close_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key,
            state: self.state,
            peer_local_id: self.peer_local_id,
        }
    }

    /// Outbound PDUs queued since the last drain, in send order.
    pub fn take_outbox(&mut self) -> Vec<Pdu> {
        std::mem::take(&mut self.outbox)
    }

    /// True once per change to the peer-visible snapshot or session state.
    pub fn take_snapshot_dirty(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_dirty)
    }

    /// True exactly once after the session reaches Established, so the
    /// engine can send the initial encapsulation PDUs.
    pub fn take_established_transition(&mut self) -> bool {
        std::mem::take(&mut self.entered_established)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Feed one reassembled, decoded PDU.
    pub fn handle_pdu(&mut self, pdu: Pdu, now: Instant, vendors: &VendorRegistry) {
        if self.state == SessionState::Closed {
            return;
        }
        self.last_rx = now;
        match pdu {
            Pdu::Hello(_) => self.on_hello(now),
            Pdu::Open(open) => self.on_open(open, now),
            Pdu::Keepalive(ka) => self.ack(PduType::Keepalive, ka.ack_id, now),
            Pdu::Ack(ack) => self.on_ack(ack, now),
            Pdu::Ipv4Encap(encap) => self.on_ip_encap(PduType::Ipv4Encap, encap, now),
            Pdu::Ipv6Encap(encap) => self.on_ip_encap(PduType::Ipv6Encap, encap, now),
            Pdu::MplsEncap(encap) => {
                if self.state != SessionState::Established {
                    debug!("session {}: encapsulation before Established, ignoring", self.key);
                    return;
                }
                self.ack(PduType::MplsEncap, encap.ack_id, now);
                self.peer_snapshot.mpls = encap.entries;
                self.snapshot_dirty = true;
            }
            Pdu::Vendor(vendor) => self.on_vendor(vendor, now, vendors),
            Pdu::Error(err) => self.on_error(err, now),
            Pdu::Close(close) => self.on_close(close, now),
        }
    }

    fn on_hello(&mut self, now: Instant) {
        if self.state == SessionState::Idle && self.initiator {
            self.send_open_maybe(now);
        }
    }

    fn on_open(&mut self, open: OpenPdu, now: Instant) {
        if self.peer_nonce == Some(open.nonce) {
            debug!("session {}: duplicate OPEN, re-acking", self.key);
            self.ack(PduType::Open, open.ack_id, now);
            return;
        }
        if self.peer_nonce.is_some() {
            info!("session {}: peer restarted (new OPEN nonce)", self.key);
            self.reset_exchange(now);
        }
        self.peer_nonce = Some(open.nonce);
        self.peer_local_id = Some(open.local_id);
        self.peer_hold_time = Some(Duration::from_secs(u64::from(open.hold_time)));
        self.peer_open_seen = true;
        self.ack(PduType::Open, open.ack_id, now);
        self.send_open_maybe(now);
        if !self.maybe_established(now) {
            self.transition(SessionState::OpenRcvd);
        }
    }

    fn on_ack(&mut self, ack: AckPdu, now: Instant) {
        let matches = self
            .inflight
            .get(&ack.acked_type)
            .is_some_and(|entry| entry.ack_id == ack.ack_id);
        if !matches {
            debug!(
                "session {}: ACK for {} id {} matches nothing",
                self.key, ack.acked_type, ack.ack_id
            );
            return;
        }
        self.inflight.remove(&ack.acked_type);
        match ack.acked_type {
            PduType::Open => {
                self.our_open_acked = true;
                self.maybe_established(now);
            }
            PduType::Close => {
                self.transition(SessionState::Closed);
                return;
            }
            _ => {}
        }
        if let Some(next) = self.deferred.remove(&ack.acked_type) {
            self.send_pdu(next, now);
        }
    }

    fn on_ip_encap(&mut self, kind: PduType, encap: EncapPdu, now: Instant) {
        if self.state != SessionState::Established {
            debug!("session {}: encapsulation before Established, ignoring", self.key);
            return;
        }
        self.ack(kind, encap.ack_id, now);
        match kind {
            PduType::Ipv4Encap => self.peer_snapshot.ipv4 = encap.entries,
            _ => self.peer_snapshot.ipv6 = encap.entries,
        }
        self.snapshot_dirty = true;
    }

    fn on_vendor(&mut self, vendor: VendorPdu, now: Instant, vendors: &VendorRegistry) {
        if self.state != SessionState::Established {
            debug!("session {}: VENDOR before Established, ignoring", self.key);
            return;
        }
        self.ack(PduType::Vendor, vendor.ack_id, now);
        match vendors.decide(&vendor, &self.info()) {
            None => {
                debug!(
                    "session {}: no handler for enterprise {}, discarding",
                    self.key, vendor.enterprise
                );
            }
            Some(VendorDecision::Accept) => {
                debug!(
                    "session {}: vendor PDU for enterprise {} accepted",
                    self.key, vendor.enterprise
                );
            }
            Some(VendorDecision::Reject { detail }) => {
                warn!(
                    "session {}: vendor PDU for enterprise {} rejected",
                    self.key, vendor.enterprise
                );
                self.send_pdu(
                    Pdu::Error(ErrorPdu {
                        ack_id: 0,
                        code: ErrorCode::VendorRejected,
                        detail,
                    }),
                    now,
                );
            }
        }
    }

    fn on_error(&mut self, err: ErrorPdu, now: Instant) {
        warn!(
            "session {}: peer reported {:?} ({} detail bytes)",
            self.key,
            err.code,
            err.detail.len()
        );
        self.ack(PduType::Error, err.ack_id, now);
        if err.code.is_fatal() {
            self.begin_close(CloseReason::FatalError, now);
        }
    }

    fn on_close(&mut self, close: ClosePdu, now: Instant) {
        self.ack(PduType::Close, close.ack_id, now);
        match self.state {
            SessionState::Closing => {} // our own CLOSE is already in flight
            SessionState::Idle => {
                self.close_reason = Some(CloseReason::PeerClose);
                self.transition(SessionState::Closed);
            }
            _ => {
                self.close_reason = Some(CloseReason::PeerClose);
                self.send_pdu(Pdu::Close(ClosePdu { ack_id: 0 }), now);
                self.transition(SessionState::Closing);
            }
        }
    }

    /// A PDU from this peer failed to decode. Per policy, reply with ERROR
    /// and stay put, unless the failure is fatal.
    pub fn report_decode_failure(&mut self, err: &ProtocolError, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }
        match err {
            ProtocolError::VersionMismatch(_) => {
                self.send_pdu(
                    Pdu::Error(ErrorPdu {
                        ack_id: 0,
                        code: ErrorCode::VersionMismatch,
                        detail: Vec::new(),
                    }),
                    now,
                );
                self.begin_close(CloseReason::FatalError, now);
            }
            _ => {
                let detail = err.to_string().into_bytes();
                self.send_pdu(
                    Pdu::Error(ErrorPdu {
                        ack_id: 0,
                        code: ErrorCode::MalformedPdu,
                        detail,
                    }),
                    now,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue a locally generated encapsulation advertisement.
    pub fn advertise(&mut self, pdu: Pdu, now: Instant) {
        if self.state != SessionState::Established {
            return;
        }
        self.send_pdu(pdu, now);
    }

    /// Start a clean local close.
    pub fn begin_close(&mut self, reason: CloseReason, now: Instant) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.close_reason = Some(reason);
        self.send_pdu(Pdu::Close(ClosePdu { ack_id: 0 }), now);
        self.transition(SessionState::Closing);
    }

    /// Hard stop: no CLOSE exchange, straight to terminal.
    pub fn terminate(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.close_reason = Some(reason);
        self.inflight.clear();
        self.deferred.clear();
        self.transition(SessionState::Closed);
    }

    fn send_open_maybe(&mut self, now: Instant) {
        if self.our_open_acked || self.inflight.contains_key(&PduType::Open) {
            return;
        }
        let open = OpenPdu {
            ack_id: 0,
            nonce: self.our_nonce,
            local_id: self.cfg.local_id,
            hold_time: self.cfg.hold_time.as_secs().min(u64::from(u16::MAX)) as u16,
            attributes: Vec::new(),
        };
        self.send_pdu(Pdu::Open(open), now);
        if self.state == SessionState::Idle {
            self.transition(SessionState::OpenSent);
        }
    }

    fn ack(&mut self, acked_type: PduType, ack_id: u32, now: Instant) {
        self.emit(Pdu::Ack(AckPdu { acked_type, ack_id }), now);
    }

    /// Queue a PDU, assigning its ack-id and retransmission entry. A PDU
    /// whose kind already has one in flight lands in the deferred slot
    /// instead, replacing any older deferred PDU of that kind.
    fn send_pdu(&mut self, mut pdu: Pdu, now: Instant) {
        let kind = pdu.pdu_type();
        if !kind.is_acknowledgeable() {
            self.emit(pdu, now);
            return;
        }
        if self.inflight.contains_key(&kind) {
            debug!("session {}: deferring {kind} behind in-flight one", self.key);
            self.deferred.insert(kind, pdu);
            return;
        }
        self.ack_counter = self.ack_counter.wrapping_add(1);
        let ack_id = self.ack_counter;
        pdu.set_ack_id(ack_id);
        self.inflight.insert(
            kind,
            Inflight {
                pdu: pdu.clone(),
                ack_id,
                next_retry: now + self.cfg.retransmit_base,
                interval: self.cfg.retransmit_base,
                attempts: 1,
            },
        );
        self.emit(pdu, now);
    }

    fn emit(&mut self, pdu: Pdu, now: Instant) {
        self.last_tx = now;
        self.outbox.push(pdu);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Service every expired deadline: hold time, retransmissions, and the
    /// keepalive send timer.
    pub fn check_timers(&mut self, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }

        if now >= self.last_rx + self.effective_hold() {
            match self.state {
                SessionState::Established | SessionState::Closing => {
                    // Peer presumed unreachable: terminal, no CLOSE.
                    info!("session {}: hold time expired", self.key);
                    self.terminate(CloseReason::KeepaliveTimeout);
                    self.snapshot_dirty = true;
                    return;
                }
                SessionState::OpenSent | SessionState::OpenRcvd => {
                    info!("session {}: OPEN exchange timed out, back to Idle", self.key);
                    self.reset_exchange(now);
                    return;
                }
                SessionState::Idle => {
                    debug!("session {}: idle peer expired", self.key);
                    self.terminate(CloseReason::KeepaliveTimeout);
                    return;
                }
                SessionState::Closed => unreachable!(),
            }
        }

        let mut expired: Vec<PduType> = self
            .inflight
            .iter()
            .filter(|(_, e)| e.next_retry <= now)
            .map(|(k, _)| *k)
            .collect();
        expired.sort_by_key(|k| *k as u8);
        for kind in expired {
            let max_attempts = self.cfg.max_attempts;
            let cap = self.cfg.retransmit_cap;
            let entry = self.inflight.get_mut(&kind).unwrap();
            if entry.attempts >= max_attempts {
                warn!(
                    "session {}: {kind} unacknowledged after {} attempts",
                    self.key, entry.attempts
                );
                self.terminate(CloseReason::RetransmitExhausted);
                self.snapshot_dirty = true;
                return;
            }
            entry.attempts += 1;
            entry.interval = (entry.interval * 2).min(cap);
            entry.next_retry = now + entry.interval;
            let pdu = entry.pdu.clone();
            debug!(
                "session {}: retransmitting {kind} (attempt {})",
                self.key, entry.attempts
            );
            self.emit(pdu, now);
        }

        if self.state == SessionState::Established
            && now >= self.last_tx + self.cfg.keepalive_interval
            && !self.inflight.contains_key(&PduType::Keepalive)
        {
            self.send_pdu(Pdu::Keepalive(KeepalivePdu { ack_id: 0 }), now);
        }
    }

    /// Earliest instant at which [`check_timers`](Self::check_timers) has
    /// work to do. None once terminal.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state == SessionState::Closed {
            return None;
        }
        let mut deadline = self.last_rx + self.effective_hold();
        for entry in self.inflight.values() {
            deadline = deadline.min(entry.next_retry);
        }
        if self.state == SessionState::Established {
            deadline = deadline.min(self.last_tx + self.cfg.keepalive_interval);
        }
        Some(deadline)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn effective_hold(&self) -> Duration {
        match self.peer_hold_time {
            Some(peer) => self.cfg.hold_time.min(peer),
            None => self.cfg.hold_time,
        }
    }

    fn maybe_established(&mut self, _now: Instant) -> bool {
        if !(self.our_open_acked && self.peer_open_seen) {
            return false;
        }
        if self.state == SessionState::Established {
            return true;
        }
        self.transition(SessionState::Established);
        self.entered_established = true;
        self.snapshot_dirty = true;
        if let Some(id) = self.peer_local_id {
            info!(
                "session {}: established with peer id {}",
                self.key,
                hex::encode(id)
            );
        }
        true
    }

    /// Drop all exchange state and return to Idle, as after an OPEN
    /// timeout or a peer restart.
    fn reset_exchange(&mut self, _now: Instant) {
        self.our_open_acked = false;
        self.peer_open_seen = false;
        self.peer_nonce = None;
        self.peer_local_id = None;
        self.peer_hold_time = None;
        self.our_nonce = rand::random();
        self.inflight.clear();
        self.deferred.clear();
        self.peer_snapshot = PeerSnapshot::default();
        self.snapshot_dirty = true;
        self.transition(SessionState::Idle);
    }

    fn transition(&mut self, new: SessionState) {
        if self.state != new {
            info!("session {}: {:?} -> {:?}", self.key, self.state, new);
            self.state = new;
            self.snapshot_dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HelloPdu;

    const LOCAL_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
    const PEER_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);

    fn cfg() -> SessionConfig {
        SessionConfig {
            local_id: [1; 10],
            hold_time: Duration::from_secs(40),
            keepalive_interval: Duration::from_secs(10),
            retransmit_base: Duration::from_secs(1),
            retransmit_cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    fn initiator(now: Instant) -> Session {
        // Local MAC is lower, so this side opens.
        let key = PeerKey {
            ifindex: 2,
            mac: PEER_MAC,
        };
        Session::new(key, LOCAL_MAC, cfg(), now)
    }

    fn responder(now: Instant) -> Session {
        let key = PeerKey {
            ifindex: 2,
            mac: LOCAL_MAC,
        };
        Session::new(key, PEER_MAC, cfg(), now)
    }

    fn hello() -> Pdu {
        Pdu::Hello(HelloPdu { mac: PEER_MAC })
    }

    fn peer_open(nonce: [u8; 4], ack_id: u32) -> Pdu {
        Pdu::Open(OpenPdu {
            ack_id,
            nonce,
            local_id: [7; 10],
            hold_time: 40,
            attributes: Vec::new(),
        })
    }

    fn ack_for(pdu: &Pdu) -> Pdu {
        Pdu::Ack(AckPdu {
            acked_type: pdu.pdu_type(),
            ack_id: pdu.ack_id().unwrap(),
        })
    }

    fn sample_encap(ack_id: u32) -> Pdu {
        Pdu::Ipv4Encap(EncapPdu {
            ack_id,
            entries: vec![IpEncap {
                flags: 0,
                addr: "10.0.0.2".parse().unwrap(),
                prefix_len: 24,
            }],
        })
    }

    /// Drive a session to Established, returning it.
    fn established(now: Instant) -> Session {
        let reg = VendorRegistry::new();
        let mut s = initiator(now);
        s.handle_pdu(hello(), now, &reg);
        let open = s
            .take_outbox()
            .into_iter()
            .find(|p| p.pdu_type() == PduType::Open)
            .expect("initiator sends OPEN");
        s.handle_pdu(ack_for(&open), now, &reg);
        s.handle_pdu(peer_open([9, 9, 9, 9], 1), now, &reg);
        assert!(s.is_established());
        s.take_outbox();
        s.take_snapshot_dirty();
        s.take_established_transition();
        s
    }

    #[test]
    fn test_initiator_handshake() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = initiator(now);
        assert_eq!(s.state(), SessionState::Idle);

        s.handle_pdu(hello(), now, &reg);
        assert_eq!(s.state(), SessionState::OpenSent);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pdu_type(), PduType::Open);

        // Peer ACKs our OPEN, then sends its own.
        s.handle_pdu(ack_for(&out[0]), now, &reg);
        assert_eq!(s.state(), SessionState::OpenSent);
        s.handle_pdu(peer_open([1, 2, 3, 4], 1), now, &reg);
        assert!(s.is_established());
        assert!(s.take_established_transition());
        assert_eq!(s.peer_local_id, Some([7; 10]));

        // The peer's OPEN got ACKed.
        let out = s.take_outbox();
        assert!(out
            .iter()
            .any(|p| matches!(p, Pdu::Ack(a) if a.acked_type == PduType::Open && a.ack_id == 1)));
    }

    #[test]
    fn test_responder_handshake() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = responder(now);

        // Responder never opens on HELLO alone.
        s.handle_pdu(Pdu::Hello(HelloPdu { mac: LOCAL_MAC }), now, &reg);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.take_outbox().is_empty());

        // Peer's OPEN arrives: we ACK and answer with our own OPEN.
        s.handle_pdu(peer_open([1, 1, 1, 1], 1), now, &reg);
        assert_eq!(s.state(), SessionState::OpenRcvd);
        let out = s.take_outbox();
        assert_eq!(out[0].pdu_type(), PduType::Ack);
        assert_eq!(out[1].pdu_type(), PduType::Open);

        s.handle_pdu(ack_for(&out[1]), now, &reg);
        assert!(s.is_established());
    }

    #[test]
    fn test_equal_macs_both_initiate() {
        let now = Instant::now();
        let key = PeerKey {
            ifindex: 2,
            mac: LOCAL_MAC,
        };
        let mut s = Session::new(key, LOCAL_MAC, cfg(), now);
        let reg = VendorRegistry::new();
        s.handle_pdu(Pdu::Hello(HelloPdu { mac: LOCAL_MAC }), now, &reg);
        // Tie broken toward initiating; the exchange itself is idempotent.
        assert_eq!(s.state(), SessionState::OpenSent);
    }

    #[test]
    fn test_duplicate_open_is_reacked_only() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(now);
        let id_before = s.peer_local_id;

        s.handle_pdu(peer_open([9, 9, 9, 9], 1), now, &reg);
        assert!(s.is_established());
        assert_eq!(s.peer_local_id, id_before);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pdu_type(), PduType::Ack);
    }

    #[test]
    fn test_new_nonce_resets_session() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(now);

        s.handle_pdu(peer_open([8, 8, 8, 8], 5), now, &reg);
        // Fresh exchange: peer OPEN seen, ours not yet acked.
        assert_eq!(s.state(), SessionState::OpenRcvd);
        let out = s.take_outbox();
        assert!(out.iter().any(|p| p.pdu_type() == PduType::Open));
    }

    #[test]
    fn test_retransmit_then_ack_drains_queue() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        s.advertise(sample_encap(0), start);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        let first_id = out[0].ack_id().unwrap();

        // Nothing before the base timeout.
        s.check_timers(start + Duration::from_millis(500));
        assert!(s.take_outbox().is_empty());

        // First retransmission keeps the same ack id.
        s.check_timers(start + Duration::from_millis(1100));
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ack_id().unwrap(), first_id);

        // The (re)transmission is ACKed; queue drains, no state change.
        s.handle_pdu(ack_for(&out[0]), start + Duration::from_millis(1200), &reg);
        assert!(s.is_established());
        s.check_timers(start + Duration::from_secs(5));
        let out = s.take_outbox();
        assert!(out.iter().all(|p| p.pdu_type() != PduType::Ipv4Encap));
    }

    #[test]
    fn test_retransmit_exhaustion_terminates() {
        let start = Instant::now();
        let mut s = established(start);
        s.advertise(sample_encap(0), start);
        s.take_outbox();

        // Backoff doubles each round; march time far enough for five
        // attempts to elapse.
        let mut now = start;
        for _ in 0..6 {
            now += Duration::from_secs(40);
            // Keep the hold timer satisfied; only retransmission may fire.
            s.last_rx = now;
            s.check_timers(now);
        }
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::RetransmitExhausted));
    }

    #[test]
    fn test_at_most_one_inflight_with_deferred_replacement() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        s.advertise(sample_encap(0), start);
        let first = s.take_outbox().remove(0);

        // Two more advertisements of the same kind pile into the single
        // deferred slot; only the newest survives.
        let second = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 0,
            entries: Vec::new(),
        });
        let third = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 0,
            entries: vec![IpEncap {
                flags: 0,
                addr: "10.9.9.9".parse().unwrap(),
                prefix_len: 32,
            }],
        });
        s.advertise(second, start);
        s.advertise(third.clone(), start);
        assert!(s.take_outbox().is_empty());

        s.handle_pdu(ack_for(&first), start, &reg);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Pdu::Ipv4Encap(e) => assert_eq!(e.entries.len(), 1),
            other => panic!("expected deferred encap, got {other:?}"),
        }
        // And its ack id moved on.
        assert_ne!(out[0].ack_id(), first.ack_id());
    }

    #[test]
    fn test_keepalive_sent_after_send_silence() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        // Nothing fires before the keepalive interval elapses.
        s.check_timers(start + Duration::from_secs(9));
        assert!(s.take_outbox().is_empty());

        s.check_timers(start + Duration::from_secs(11));
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pdu_type(), PduType::Keepalive);
        let first_id = out[0].ack_id().unwrap();

        // The ACK drains it; the next keepalive, one interval of send
        // silence later, carries a fresh id.
        s.handle_pdu(ack_for(&out[0]), start + Duration::from_secs(12), &reg);
        s.check_timers(start + Duration::from_secs(15));
        assert!(s.take_outbox().is_empty());
        s.check_timers(start + Duration::from_secs(22));
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pdu_type(), PduType::Keepalive);
        assert_ne!(out[0].ack_id().unwrap(), first_id);
    }

    #[test]
    fn test_hold_timeout_terminates_without_close() {
        let start = Instant::now();
        let mut s = established(start);

        s.check_timers(start + Duration::from_secs(39));
        assert!(s.is_established());

        s.check_timers(start + Duration::from_secs(41));
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::KeepaliveTimeout));
        // Terminal without CLOSE: the peer is presumed unreachable.
        assert!(s
            .take_outbox()
            .iter()
            .all(|p| p.pdu_type() != PduType::Close));
    }

    #[test]
    fn test_peer_hold_time_minimum_wins() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = initiator(now);
        s.handle_pdu(hello(), now, &reg);
        let open = s.take_outbox().remove(0);
        s.handle_pdu(ack_for(&open), now, &reg);
        s.handle_pdu(
            Pdu::Open(OpenPdu {
                ack_id: 1,
                nonce: [1, 1, 1, 1],
                local_id: [7; 10],
                hold_time: 15,
                attributes: Vec::new(),
            }),
            now,
            &reg,
        );
        assert!(s.is_established());
        s.take_outbox();

        s.check_timers(now + Duration::from_secs(16));
        assert!(s.is_closed());
    }

    #[test]
    fn test_open_timeout_resets_to_idle() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = initiator(start);
        s.handle_pdu(hello(), start, &reg);
        assert_eq!(s.state(), SessionState::OpenSent);
        s.take_outbox();

        s.check_timers(start + Duration::from_secs(41));
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_closed());
    }

    #[test]
    fn test_encap_replaces_snapshot_atomically() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        s.handle_pdu(sample_encap(10), start, &reg);
        assert_eq!(s.peer_snapshot.ipv4.len(), 1);
        assert!(s.take_snapshot_dirty());

        let replacement = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 11,
            entries: vec![
                IpEncap {
                    flags: 0,
                    addr: "10.1.0.1".parse().unwrap(),
                    prefix_len: 24,
                },
                IpEncap {
                    flags: 0,
                    addr: "10.2.0.1".parse().unwrap(),
                    prefix_len: 24,
                },
            ],
        });
        s.handle_pdu(replacement, start, &reg);
        assert_eq!(s.peer_snapshot.ipv4.len(), 2);
        assert!(s
            .peer_snapshot
            .ipv4
            .iter()
            .all(|e| e.addr != "10.0.0.2".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn test_encap_before_established_ignored() {
        let now = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = responder(now);
        s.handle_pdu(sample_encap(3), now, &reg);
        assert!(s.peer_snapshot.ipv4.is_empty());
        assert!(s.take_outbox().is_empty());
    }

    #[test]
    fn test_close_handshake() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        s.handle_pdu(Pdu::Close(ClosePdu { ack_id: 42 }), start, &reg);
        assert_eq!(s.state(), SessionState::Closing);
        let out = s.take_outbox();
        assert!(out
            .iter()
            .any(|p| matches!(p, Pdu::Ack(a) if a.acked_type == PduType::Close && a.ack_id == 42)));
        let our_close = out
            .iter()
            .find(|p| p.pdu_type() == PduType::Close)
            .expect("answering CLOSE");

        s.handle_pdu(ack_for(our_close), start, &reg);
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::PeerClose));
    }

    #[test]
    fn test_local_close() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);

        s.begin_close(CloseReason::LocalClose, start);
        assert_eq!(s.state(), SessionState::Closing);
        let close = s.take_outbox().remove(0);
        assert_eq!(close.pdu_type(), PduType::Close);

        s.handle_pdu(ack_for(&close), start, &reg);
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::LocalClose));
    }

    #[test]
    fn test_decode_failure_keeps_state() {
        let start = Instant::now();
        let mut s = established(start);

        s.report_decode_failure(&ProtocolError::malformed("count overrun"), start);
        assert!(s.is_established());
        let out = s.take_outbox();
        assert!(matches!(
            &out[0],
            Pdu::Error(e) if e.code == ErrorCode::MalformedPdu
        ));
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let start = Instant::now();
        let mut s = established(start);

        s.report_decode_failure(&ProtocolError::VersionMismatch(3), start);
        assert_eq!(s.state(), SessionState::Closing);
        let out = s.take_outbox();
        assert!(out.iter().any(
            |p| matches!(p, Pdu::Error(e) if e.code == ErrorCode::VersionMismatch)
        ));
        assert!(out.iter().any(|p| p.pdu_type() == PduType::Close));
    }

    struct Rejecting;
    impl VendorHandler for Rejecting {
        fn handle(&self, _pdu: &VendorPdu, _session: &SessionInfo) -> VendorDecision {
            VendorDecision::Reject {
                detail: b"nope".to_vec(),
            }
        }
    }

    struct Accepting;
    impl VendorHandler for Accepting {
        fn handle(&self, _pdu: &VendorPdu, _session: &SessionInfo) -> VendorDecision {
            VendorDecision::Accept
        }
    }

    #[test]
    fn test_vendor_dispatch() {
        let start = Instant::now();
        let mut reg = VendorRegistry::new();
        reg.register(100, Box::new(Accepting));
        reg.register(200, Box::new(Rejecting));

        let mut s = established(start);

        // Unknown enterprise: ACKed and discarded.
        s.handle_pdu(
            Pdu::Vendor(VendorPdu {
                ack_id: 1,
                enterprise: 999,
                body: vec![1],
            }),
            start,
            &reg,
        );
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pdu_type(), PduType::Ack);

        // Accepted: ACK only.
        s.handle_pdu(
            Pdu::Vendor(VendorPdu {
                ack_id: 2,
                enterprise: 100,
                body: vec![1],
            }),
            start,
            &reg,
        );
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);

        // Rejected: ACK plus a non-fatal ERROR; session stays up.
        s.handle_pdu(
            Pdu::Vendor(VendorPdu {
                ack_id: 3,
                enterprise: 200,
                body: vec![1],
            }),
            start,
            &reg,
        );
        let out = s.take_outbox();
        assert!(out.iter().any(
            |p| matches!(p, Pdu::Error(e) if e.code == ErrorCode::VendorRejected)
        ));
        assert!(s.is_established());
    }

    #[test]
    fn test_no_transitions_from_terminal() {
        let start = Instant::now();
        let reg = VendorRegistry::new();
        let mut s = established(start);
        s.terminate(CloseReason::LinkDown);
        assert!(s.is_closed());

        s.handle_pdu(hello(), start, &reg);
        s.handle_pdu(peer_open([5, 5, 5, 5], 9), start, &reg);
        s.check_timers(start + Duration::from_secs(500));
        assert!(s.is_closed());
        assert!(s.take_outbox().is_empty());
        assert!(s.next_deadline().is_none());
    }
}
