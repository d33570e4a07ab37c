//! Interface and address monitoring via rtnetlink.
//!
//! Enumerates interfaces at startup, subscribes to link and IPv4/IPv6
//! address multicast groups, and publishes a normalized event stream. The
//! monitor is the sole source of truth about local interface state; the
//! engine never queries the kernel itself.
//!
//! Some kernels fail to deliver IPv6 address events reliably, so the route
//! multicast groups are joined as well and every route event triggers a
//! full address re-dump that is diffed against the last known snapshot,
//! synthesizing whatever events were missed.

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{Context, Result};
use futures::stream::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::constants::{
    RTMGRP_IPV4_IFADDR, RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_IFADDR, RTMGRP_IPV6_ROUTE, RTMGRP_LINK,
};
use rtnetlink::{new_connection, Handle};
use tokio::sync::mpsc;

use crate::wire::MacAddr;

/// One address assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// Address scope, derived from the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrScope {
    Host,
    Link,
    Global,
}

impl IfAddr {
    pub fn scope(&self) -> AddrScope {
        match self.addr {
            IpAddr::V4(a) if a.is_loopback() => AddrScope::Host,
            IpAddr::V4(a) if a.is_link_local() => AddrScope::Link,
            IpAddr::V4(_) => AddrScope::Global,
            IpAddr::V6(a) if a.is_loopback() => AddrScope::Host,
            IpAddr::V6(a) if (a.segments()[0] & 0xffc0) == 0xfe80 => AddrScope::Link,
            IpAddr::V6(_) => AddrScope::Global,
        }
    }
}

impl AddrScope {
    pub fn as_str(self) -> &'static str {
        match self {
            AddrScope::Host => "host",
            AddrScope::Link => "link",
            AddrScope::Global => "global",
        }
    }
}

/// Snapshot of one usable interface. Interfaces without a 6-byte MAC never
/// surface here; LSOE cannot run on them.
#[derive(Debug, Clone)]
pub struct Iface {
    pub index: u32,
    pub name: String,
    pub mac: MacAddr,
    pub mtu: u32,
    pub loopback: bool,
    pub addrs: Vec<IfAddr>,
}

/// Normalized interface events. An interface that goes admin-down is
/// reported as gone; coming back up is a fresh appearance.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    InterfaceAppeared(Iface),
    InterfaceGone(u32),
    AddressAdded { index: u32, addr: IfAddr },
    AddressRemoved { index: u32, addr: IfAddr },
}

struct IfaceRec {
    iface: Iface,
    up: bool,
}

struct Monitor {
    handle: Handle,
    ifaces: HashMap<u32, IfaceRec>,
    tx: mpsc::Sender<MonitorEvent>,
}

/// Start the monitor: enumerate current state (emitting an
/// `InterfaceAppeared` per live interface) and then follow kernel events.
pub async fn start(tx: mpsc::Sender<MonitorEvent>) -> Result<()> {
    let (mut conn, handle, messages) =
        new_connection().context("failed to open netlink socket")?;

    // Join the event groups before the initial dump so nothing falls in
    // the gap between them.
    let groups = RTMGRP_LINK
        | RTMGRP_IPV4_IFADDR
        | RTMGRP_IPV6_IFADDR
        | RTMGRP_IPV4_ROUTE
        | RTMGRP_IPV6_ROUTE;
    conn.socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, groups))
        .context("failed to join rtnetlink multicast groups")?;
    tokio::spawn(conn);

    let mut monitor = Monitor {
        handle,
        ifaces: HashMap::new(),
        tx,
    };
    monitor.enumerate().await?;
    tokio::spawn(async move { monitor.run(messages).await });
    Ok(())
}

impl Monitor {
    async fn enumerate(&mut self) -> Result<()> {
        let mut links = self.handle.link().get().execute();
        while let Some(msg) = links.try_next().await.context("link dump failed")? {
            if let Some((rec, _)) = parse_link(&msg) {
                self.ifaces.insert(rec.iface.index, rec);
            }
        }

        let mut addrs = self.handle.address().get().execute();
        while let Some(msg) = addrs.try_next().await.context("address dump failed")? {
            if let Some((index, addr)) = parse_address(&msg) {
                if let Some(rec) = self.ifaces.get_mut(&index) {
                    if !rec.iface.addrs.contains(&addr) {
                        rec.iface.addrs.push(addr);
                    }
                }
            }
        }

        info!("enumerated {} interfaces", self.ifaces.len());
        for rec in self.ifaces.values() {
            debug!(
                "interface {} [{}] mac {} mtu {} addrs {:?}",
                rec.iface.name, rec.iface.index, rec.iface.mac, rec.iface.mtu, rec.iface.addrs
            );
            if rec.up {
                self.emit(MonitorEvent::InterfaceAppeared(rec.iface.clone()))
                    .await;
            }
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut messages: futures::channel::mpsc::UnboundedReceiver<(
            NetlinkMessage<RouteNetlinkMessage>,
            SocketAddr,
        )>,
    ) {
        while let Some((message, _addr)) = messages.next().await {
            let NetlinkPayload::InnerMessage(payload) = message.payload else {
                continue;
            };
            match payload {
                RouteNetlinkMessage::NewLink(link) => self.on_new_link(&link).await,
                RouteNetlinkMessage::DelLink(link) => self.on_del_link(&link).await,
                RouteNetlinkMessage::NewAddress(addr) => self.on_new_address(&addr).await,
                RouteNetlinkMessage::DelAddress(addr) => self.on_del_address(&addr).await,
                // Route churn doubles as the trigger for the IPv6 address
                // event fallback.
                RouteNetlinkMessage::NewRoute(_) | RouteNetlinkMessage::DelRoute(_) => {
                    if let Err(e) = self.resync_addresses().await {
                        warn!("address resync failed: {e:#}");
                    }
                }
                other => debug!("ignoring netlink message {other:?}"),
            }
        }
        debug!("netlink event stream ended");
    }

    async fn on_new_link(&mut self, msg: &LinkMessage) {
        let Some((parsed, up)) = parse_link(msg) else {
            return;
        };
        let index = parsed.iface.index;
        match self.ifaces.get_mut(&index) {
            Some(rec) => {
                let was_up = rec.up;
                rec.iface.name = parsed.iface.name;
                rec.iface.mac = parsed.iface.mac;
                rec.iface.mtu = parsed.iface.mtu;
                rec.iface.loopback = parsed.iface.loopback;
                rec.up = up;
                if was_up && !up {
                    self.emit(MonitorEvent::InterfaceGone(index)).await;
                } else if !was_up && up {
                    let iface = self.ifaces[&index].iface.clone();
                    self.emit(MonitorEvent::InterfaceAppeared(iface)).await;
                }
            }
            None => {
                let mut rec = parsed;
                rec.up = up;
                let iface = rec.iface.clone();
                self.ifaces.insert(index, rec);
                if up {
                    self.emit(MonitorEvent::InterfaceAppeared(iface)).await;
                }
            }
        }
    }

    async fn on_del_link(&mut self, msg: &LinkMessage) {
        let index = msg.header.index;
        if let Some(rec) = self.ifaces.remove(&index) {
            if rec.up {
                self.emit(MonitorEvent::InterfaceGone(index)).await;
            }
        }
    }

    async fn on_new_address(&mut self, msg: &AddressMessage) {
        let Some((index, addr)) = parse_address(msg) else {
            return;
        };
        let Some(rec) = self.ifaces.get_mut(&index) else {
            return;
        };
        if rec.iface.addrs.contains(&addr) {
            return;
        }
        rec.iface.addrs.push(addr);
        if rec.up {
            self.emit(MonitorEvent::AddressAdded { index, addr }).await;
        }
    }

    async fn on_del_address(&mut self, msg: &AddressMessage) {
        let Some((index, addr)) = parse_address(msg) else {
            return;
        };
        let Some(rec) = self.ifaces.get_mut(&index) else {
            return;
        };
        let Some(pos) = rec.iface.addrs.iter().position(|a| *a == addr) else {
            return;
        };
        rec.iface.addrs.remove(pos);
        if rec.up {
            self.emit(MonitorEvent::AddressRemoved { index, addr }).await;
        }
    }

    async fn resync_addresses(&mut self) -> Result<()> {
        let mut current: HashMap<u32, Vec<IfAddr>> = HashMap::new();
        let mut addrs = self.handle.address().get().execute();
        while let Some(msg) = addrs.try_next().await.context("address dump failed")? {
            if let Some((index, addr)) = parse_address(&msg) {
                let list = current.entry(index).or_default();
                if !list.contains(&addr) {
                    list.push(addr);
                }
            }
        }

        let indices: Vec<u32> = self.ifaces.keys().copied().collect();
        for index in indices {
            let dumped = current.remove(&index).unwrap_or_default();
            let rec = self.ifaces.get_mut(&index).unwrap();
            let (added, removed) = diff_addrs(&rec.iface.addrs, &dumped);
            if added.is_empty() && removed.is_empty() {
                continue;
            }
            debug!(
                "address resync on interface {}: +{} -{}",
                index,
                added.len(),
                removed.len()
            );
            rec.iface.addrs = dumped;
            let up = rec.up;
            if up {
                for addr in added {
                    self.emit(MonitorEvent::AddressAdded { index, addr }).await;
                }
                for addr in removed {
                    self.emit(MonitorEvent::AddressRemoved { index, addr }).await;
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: MonitorEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("monitor event receiver gone");
        }
    }
}

/// Addresses present in `new` but not `old`, and vice versa.
fn diff_addrs(old: &[IfAddr], new: &[IfAddr]) -> (Vec<IfAddr>, Vec<IfAddr>) {
    let added = new.iter().filter(|a| !old.contains(a)).copied().collect();
    let removed = old.iter().filter(|a| !new.contains(a)).copied().collect();
    (added, removed)
}

fn parse_link(msg: &LinkMessage) -> Option<(IfaceRec, bool)> {
    let index = msg.header.index;
    let up = msg.header.flags.contains(&LinkFlag::Up);
    let loopback = msg.header.flags.contains(&LinkFlag::Loopback);

    let mut name = None;
    let mut mac = None;
    let mut mtu = None;
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Address(bytes) if bytes.len() == 6 => {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(bytes);
                mac = Some(MacAddr(octets));
            }
            LinkAttribute::Mtu(m) => mtu = Some(*m),
            _ => {}
        }
    }

    let rec = IfaceRec {
        iface: Iface {
            index,
            name: name?,
            mac: mac?,
            mtu: mtu.unwrap_or(1500),
            loopback,
            addrs: Vec::new(),
        },
        up,
    };
    Some((rec, up))
}

fn parse_address(msg: &AddressMessage) -> Option<(u32, IfAddr)> {
    let index = msg.header.index;
    let prefix_len = msg.header.prefix_len;
    for attr in &msg.attributes {
        if let AddressAttribute::Address(ip) = attr {
            return Some((
                index,
                IfAddr {
                    addr: *ip,
                    prefix_len,
                },
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str, plen: u8) -> IfAddr {
        IfAddr {
            addr: s.parse().unwrap(),
            prefix_len: plen,
        }
    }

    #[test]
    fn test_diff_addrs_synthesizes_missing_events() {
        let old = vec![v4("10.0.0.1", 24), v4("10.0.0.2", 24)];
        let new = vec![v4("10.0.0.2", 24), v4("192.168.1.1", 16)];
        let (added, removed) = diff_addrs(&old, &new);
        assert_eq!(added, vec![v4("192.168.1.1", 16)]);
        assert_eq!(removed, vec![v4("10.0.0.1", 24)]);
    }

    #[test]
    fn test_diff_addrs_no_change() {
        let addrs = vec![v4("10.0.0.1", 24)];
        let (added, removed) = diff_addrs(&addrs, &addrs);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_addr_scope() {
        assert_eq!(v4("127.0.0.1", 8).scope(), AddrScope::Host);
        assert_eq!(v4("169.254.1.1", 16).scope(), AddrScope::Link);
        assert_eq!(v4("192.0.2.1", 24).scope(), AddrScope::Global);

        let link_local = IfAddr {
            addr: "fe80::1".parse().unwrap(),
            prefix_len: 64,
        };
        assert_eq!(link_local.scope(), AddrScope::Link);
        let global = IfAddr {
            addr: "2001:db8::1".parse().unwrap(),
            prefix_len: 64,
        };
        assert_eq!(global.scope(), AddrScope::Global);
    }
}
