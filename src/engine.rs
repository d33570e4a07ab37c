//! Process-wide coordinator: session table, HELLO beacon, and the single
//! scheduler loop.
//!
//! One task owns every session, socket handle, and deadline. Per-interface
//! reader tasks and the netlink monitor are plumbing only; they forward
//! events into the engine's queue and hold no protocol state. Each loop
//! iteration computes the earliest deadline across the beacon, the
//! reassembler, and every session, and waits on the queues with that
//! timeout.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ProtocolError;
use crate::frame::{self, FeedOutcome, PeerKey, Reassembler};
use crate::metrics::{DropReason, Metrics};
use crate::netio::{EtherSocket, MacCache};
use crate::netmon::{self, Iface, MonitorEvent};
use crate::northbound::{Reporter, Snapshot};
use crate::session::{CloseReason, Session, SessionConfig, VendorRegistry};
use crate::wire::{EncapPdu, HelloPdu, IpEncap, MacAddr, Pdu, ENCAP_FLAG_LOOPBACK};

/// Events feeding the engine loop.
pub enum Event {
    Frame {
        ifindex: u32,
        src: MacAddr,
        data: Vec<u8>,
    },
    Shutdown,
}

struct Port {
    socket: Arc<EtherSocket>,
    reader: JoinHandle<()>,
}

pub struct Engine {
    config: Config,
    session_cfg: SessionConfig,
    local_id: [u8; 10],
    hello_mac: MacAddr,
    sessions: HashMap<PeerKey, Session>,
    ifaces: HashMap<u32, Iface>,
    ports: HashMap<u32, Port>,
    reassembler: Reassembler,
    mac_cache: MacCache,
    vendors: VendorRegistry,
    reporter: Box<dyn Reporter>,
    metrics: Arc<Metrics>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    next_hello: Instant,
}

impl Engine {
    pub fn new(
        config: Config,
        reporter: Box<dyn Reporter>,
        vendors: VendorRegistry,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let local_id = config.resolve_local_id()?;
        let hello_mac = config.hello_macaddr()?;
        let session_cfg = SessionConfig {
            local_id,
            hold_time: config.hold_time(),
            keepalive_interval: config.keepalive_interval(),
            retransmit_base: config.retransmit_base(),
            retransmit_cap: config.retransmit_cap(),
            max_attempts: config.max_attempts,
        };
        let (event_tx, event_rx) = mpsc::channel(1024);
        Ok(Self {
            reassembler: Reassembler::new(config.reassembly_ttl()),
            mac_cache: MacCache::new(config.mac_cache_timeout()),
            config,
            session_cfg,
            local_id,
            hello_mac,
            sessions: HashMap::new(),
            ifaces: HashMap::new(),
            ports: HashMap::new(),
            vendors,
            reporter,
            metrics,
            event_tx,
            event_rx,
            next_hello: Instant::now(),
        })
    }

    /// Run until shutdown. Returns cleanly on SIGINT or an explicit
    /// [`Event::Shutdown`].
    pub async fn run(mut self) -> Result<()> {
        let (mon_tx, mut mon_rx) = mpsc::channel(256);
        netmon::start(mon_tx)
            .await
            .context("interface monitor failed to start")?;
        info!("engine running, local id {}", hex::encode(self.local_id));

        loop {
            let deadline = self.next_deadline();
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    self.shutdown().await;
                    return Ok(());
                }
                event = self.event_rx.recv() => match event {
                    Some(Event::Frame { ifindex, src, data }) => {
                        self.on_frame(ifindex, src, data).await;
                    }
                    Some(Event::Shutdown) | None => {
                        self.shutdown().await;
                        return Ok(());
                    }
                },
                event = mon_rx.recv() => {
                    if let Some(event) = event {
                        self.on_monitor_event(event).await;
                    }
                }
                _ = &mut sleep => {}
            }

            self.service_timers().await;
            self.send_initial_encaps();
            self.flush_outboxes().await;
            self.reap_and_report();
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Earliest deadline across the HELLO beacon, reassembly GC, and every
    /// session timer.
    fn next_deadline(&self) -> tokio::time::Instant {
        let mut deadline = self.next_hello;
        for session in self.sessions.values() {
            if let Some(d) = session.next_deadline() {
                deadline = deadline.min(d);
            }
        }
        if let Some(d) = self.reassembler.next_deadline() {
            deadline = deadline.min(d);
        }
        tokio::time::Instant::from_std(deadline)
    }

    async fn service_timers(&mut self) {
        let now = Instant::now();

        for session in self.sessions.values_mut() {
            session.check_timers(now);
        }

        let expired = self.reassembler.gc(now);
        for _ in 0..expired {
            self.metrics.inc_drop(DropReason::ReassemblyTimeout);
        }

        if now >= self.next_hello {
            self.next_hello = now + self.config.hello_interval();
            self.mac_cache.purge(now);
            debug!("drop counters: {}", self.metrics.drop_summary());
            self.send_hellos().await;
        }
    }

    async fn send_hellos(&mut self) {
        let targets: Vec<(u32, MacAddr)> = self
            .ports
            .keys()
            .filter_map(|index| self.ifaces.get(index).map(|i| (*index, i.mac)))
            .collect();
        for (index, mac) in targets {
            let pdu = Pdu::Hello(HelloPdu { mac });
            if let Err(e) = self.transmit(index, self.hello_mac, &pdu).await {
                debug!("HELLO on interface {index} failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    async fn on_frame(&mut self, ifindex: u32, src: MacAddr, data: Vec<u8>) {
        self.metrics.frames_rx.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        if !self.ports.contains_key(&ifindex) {
            return;
        }
        if !self.mac_cache.observe(src, ifindex, now) {
            return;
        }
        let key = PeerKey { ifindex, mac: src };
        match self.reassembler.feed(key, &data, now) {
            FeedOutcome::Pending => {}
            FeedOutcome::Dropped(reason) => self.metrics.inc_drop(reason),
            FeedOutcome::Complete(pdu_bytes) => self.on_pdu(key, &pdu_bytes, now),
        }
    }

    fn on_pdu(&mut self, key: PeerKey, bytes: &[u8], now: Instant) {
        self.metrics.pdus_rx.fetch_add(1, Ordering::Relaxed);
        match Pdu::decode(bytes) {
            Ok(pdu @ Pdu::Hello(_)) => {
                // HELLOs are the only PDU that may create a session.
                if !self.sessions.contains_key(&key) {
                    let Some(iface) = self.ifaces.get(&key.ifindex) else {
                        return;
                    };
                    info!("session {key}: discovered via HELLO");
                    self.sessions.insert(
                        key,
                        Session::new(key, iface.mac, self.session_cfg.clone(), now),
                    );
                    self.metrics
                        .sessions_created
                        .fetch_add(1, Ordering::Relaxed);
                }
                let session = self.sessions.get_mut(&key).unwrap();
                session.handle_pdu(pdu, now, &self.vendors);
            }
            Ok(pdu) => match self.sessions.get_mut(&key) {
                Some(session) => session.handle_pdu(pdu, now, &self.vendors),
                None => debug!("{} from unknown peer {key}, dropping", pdu.pdu_type()),
            },
            Err(err) => {
                let reason = match &err {
                    ProtocolError::UnknownPduType(_) => DropReason::UnknownPduType,
                    ProtocolError::VersionMismatch(_) => DropReason::VersionMismatch,
                    _ => DropReason::Malformed,
                };
                self.metrics.inc_drop(reason);
                debug!("undecodable PDU from {key}: {err}");
                // Unknown types are dropped quietly; structural failures
                // are surfaced to the peer.
                if reason != DropReason::UnknownPduType {
                    if let Some(session) = self.sessions.get_mut(&key) {
                        session.report_decode_failure(&err, now);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Interface lifecycle
    // ------------------------------------------------------------------

    async fn on_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::InterfaceAppeared(iface) => {
                debug!(
                    "interface {} [{}] appeared with {} addresses",
                    iface.name,
                    iface.index,
                    iface.addrs.len()
                );
                self.ifaces.insert(iface.index, iface);
                self.reconcile_ports();
            }
            MonitorEvent::InterfaceGone(index) => {
                info!("interface {index} gone");
                self.ifaces.remove(&index);
                self.close_port(index);
            }
            MonitorEvent::AddressAdded { index, addr } => {
                if let Some(iface) = self.ifaces.get_mut(&index) {
                    if !iface.addrs.contains(&addr) {
                        iface.addrs.push(addr);
                    }
                    self.reconcile_ports();
                    self.readvertise(index, addr.addr.is_ipv4());
                }
            }
            MonitorEvent::AddressRemoved { index, addr } => {
                if let Some(iface) = self.ifaces.get_mut(&index) {
                    iface.addrs.retain(|a| *a != addr);
                    self.reconcile_ports();
                    self.readvertise(index, addr.addr.is_ipv4());
                }
            }
        }
    }

    /// Open sockets on newly eligible interfaces and close them on
    /// interfaces that stopped qualifying.
    fn reconcile_ports(&mut self) {
        let eligible: Vec<u32> = self
            .ifaces
            .values()
            .filter(|i| {
                self.config.interface_allowed(&i.name, i.loopback) && !i.addrs.is_empty()
            })
            .map(|i| i.index)
            .collect();

        let to_close: Vec<u32> = self
            .ports
            .keys()
            .filter(|index| !eligible.contains(index))
            .copied()
            .collect();
        for index in to_close {
            info!("interface {index} no longer eligible");
            self.close_port(index);
        }

        for index in eligible {
            if self.ports.contains_key(&index) {
                continue;
            }
            let iface = &self.ifaces[&index];
            match EtherSocket::open(
                index,
                self.config.ethertype,
                iface.mtu as usize,
                self.hello_mac,
            ) {
                Ok(socket) => {
                    info!(
                        "listening on {} [{}] mac {} mtu {}",
                        iface.name, index, iface.mac, iface.mtu
                    );
                    let socket = Arc::new(socket);
                    let reader = spawn_reader(socket.clone(), self.event_tx.clone());
                    self.ports.insert(index, Port { socket, reader });
                    // Beacon immediately so neighbors learn about us fast.
                    self.next_hello = Instant::now();
                }
                Err(e) => error!("failed to open LSOE socket on {}: {e}", iface.name),
            }
        }
    }

    fn close_port(&mut self, index: u32) {
        if let Some(port) = self.ports.remove(&index) {
            port.reader.abort();
        }
        self.mac_cache.forget_interface(index);
        for (key, session) in self.sessions.iter_mut() {
            if key.ifindex == index {
                session.terminate(CloseReason::LinkDown);
                self.reassembler.forget(*key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Queue the affected family's encapsulation PDU on every established
    /// session riding the changed interface.
    fn readvertise(&mut self, index: u32, ipv4: bool) {
        let Some(iface) = self.ifaces.get(&index) else {
            return;
        };
        let pdu = if ipv4 {
            build_ipv4_encap(iface)
        } else {
            build_ipv6_encap(iface)
        };
        let now = Instant::now();
        for (key, session) in self.sessions.iter_mut() {
            if key.ifindex == index && session.is_established() {
                session.advertise(pdu.clone(), now);
            }
        }
    }

    /// Sessions that just reached Established get one encapsulation PDU
    /// per address family with non-empty content. MPLS stays silent until
    /// there is something to say.
    fn send_initial_encaps(&mut self) {
        let now = Instant::now();
        let keys: Vec<PeerKey> = self.sessions.keys().copied().collect();
        for key in keys {
            let fresh = self
                .sessions
                .get_mut(&key)
                .is_some_and(|s| s.take_established_transition());
            if !fresh {
                continue;
            }
            self.metrics
                .sessions_established
                .fetch_add(1, Ordering::Relaxed);
            let Some(iface) = self.ifaces.get(&key.ifindex) else {
                continue;
            };
            let v4 = build_ipv4_encap(iface);
            let v6 = build_ipv6_encap(iface);
            let session = self.sessions.get_mut(&key).unwrap();
            if let Pdu::Ipv4Encap(ref e) = v4 {
                if !e.entries.is_empty() {
                    session.advertise(v4.clone(), now);
                }
            }
            if let Pdu::Ipv6Encap(ref e) = v6 {
                if !e.entries.is_empty() {
                    session.advertise(v6.clone(), now);
                }
            }
        }
    }

    async fn flush_outboxes(&mut self) {
        let keys: Vec<PeerKey> = self.sessions.keys().copied().collect();
        for key in keys {
            let pdus = match self.sessions.get_mut(&key) {
                Some(session) => session.take_outbox(),
                None => continue,
            };
            if pdus.is_empty() {
                continue;
            }
            let mut failure = None;
            for pdu in &pdus {
                if let Err(e) = self.transmit(key.ifindex, key.mac, pdu).await {
                    failure = Some(e);
                    break;
                }
            }
            match failure {
                Some(ProtocolError::LinkDown) | Some(ProtocolError::Io(_)) => {
                    warn!("session {key}: send failed, link down");
                    if let Some(session) = self.sessions.get_mut(&key) {
                        session.terminate(CloseReason::LinkDown);
                    }
                }
                Some(e) => warn!("session {key}: send failed: {e}"),
                None => {}
            }
        }
    }

    async fn transmit(
        &self,
        ifindex: u32,
        dst: MacAddr,
        pdu: &Pdu,
    ) -> Result<(), ProtocolError> {
        let Some(port) = self.ports.get(&ifindex) else {
            return Err(ProtocolError::LinkDown);
        };
        let socket = port.socket.clone();
        let bytes = pdu.encode()?;
        let frames = frame::fragment(&bytes, socket.mtu())?;
        for f in frames {
            socket.send(dst, &f).await?;
            self.metrics
                .frames_tx
                .fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .pdus_tx
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reaping and reporting
    // ------------------------------------------------------------------

    fn reap_and_report(&mut self) {
        let mut dirty = false;

        let closed: Vec<PeerKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_closed())
            .map(|(k, _)| *k)
            .collect();
        for key in closed {
            let session = self.sessions.remove(&key).unwrap();
            info!(
                "session {key}: closed ({:?})",
                session.close_reason().unwrap_or(CloseReason::LocalClose)
            );
            self.reassembler.forget(key);
            self.metrics
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
            dirty = true;
        }

        for session in self.sessions.values_mut() {
            if session.take_snapshot_dirty() {
                dirty = true;
            }
        }

        if dirty {
            self.push_snapshot();
        }
    }

    fn push_snapshot(&mut self) {
        let snapshot = Snapshot::build(
            self.local_id,
            self.ifaces
                .values()
                .filter(|i| self.ports.contains_key(&i.index)),
            self.sessions.values(),
        );
        self.reporter.push(snapshot);
        self.metrics
            .northbound_pushes
            .fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    async fn shutdown(&mut self) {
        let now = Instant::now();
        for session in self.sessions.values_mut() {
            if session.is_established() {
                session.begin_close(CloseReason::Shutdown, now);
            }
        }
        // Best effort: one pass, no retransmission wait.
        self.flush_outboxes().await;
        for (_, port) in self.ports.drain() {
            port.reader.abort();
        }
        info!("shutdown complete; final drop counters: {}", self.metrics.drop_summary());
    }
}

fn spawn_reader(socket: Arc<EtherSocket>, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match socket.recv(&mut buf).await {
                Ok((src, len)) => {
                    let event = Event::Frame {
                        ifindex: socket.ifindex(),
                        src,
                        data: buf[..len].to_vec(),
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("receive on interface {} ended: {e}", socket.ifindex());
                    break;
                }
            }
        }
    })
}

fn build_ipv4_encap(iface: &Iface) -> Pdu {
    let entries: Vec<IpEncap> = iface
        .addrs
        .iter()
        .filter(|a| a.addr.is_ipv4())
        .map(|a| IpEncap {
            flags: if iface.loopback { ENCAP_FLAG_LOOPBACK } else { 0 },
            addr: a.addr,
            prefix_len: a.prefix_len,
        })
        .collect();
    Pdu::Ipv4Encap(EncapPdu { ack_id: 0, entries })
}

fn build_ipv6_encap(iface: &Iface) -> Pdu {
    let entries: Vec<IpEncap> = iface
        .addrs
        .iter()
        .filter(|a| !a.addr.is_ipv4())
        .map(|a| IpEncap {
            flags: if iface.loopback { ENCAP_FLAG_LOOPBACK } else { 0 },
            addr: a.addr,
            prefix_len: a.prefix_len,
        })
        .collect();
    Pdu::Ipv6Encap(EncapPdu { ack_id: 0, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmon::IfAddr;

    fn iface_with(addrs: Vec<IfAddr>) -> Iface {
        Iface {
            index: 2,
            name: "eth0".into(),
            mac: MacAddr([2, 0, 0, 0, 0, 1]),
            mtu: 1500,
            loopback: false,
            addrs,
        }
    }

    #[test]
    fn test_encap_builders_split_families() {
        let iface = iface_with(vec![
            IfAddr {
                addr: "10.0.0.1".parse().unwrap(),
                prefix_len: 24,
            },
            IfAddr {
                addr: "2001:db8::1".parse().unwrap(),
                prefix_len: 64,
            },
        ]);

        match build_ipv4_encap(&iface) {
            Pdu::Ipv4Encap(e) => {
                assert_eq!(e.entries.len(), 1);
                assert!(e.entries[0].addr.is_ipv4());
            }
            other => panic!("unexpected {other:?}"),
        }
        match build_ipv6_encap(&iface) {
            Pdu::Ipv6Encap(e) => {
                assert_eq!(e.entries.len(), 1);
                assert!(!e.entries[0].addr.is_ipv4());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_encap_builder_marks_loopback() {
        let mut iface = iface_with(vec![IfAddr {
            addr: "127.0.0.1".parse().unwrap(),
            prefix_len: 8,
        }]);
        iface.loopback = true;
        match build_ipv4_encap(&iface) {
            Pdu::Ipv4Encap(e) => assert!(e.entries[0].is_loopback()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
