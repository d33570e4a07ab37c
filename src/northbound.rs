//! Northbound reporting: RFC 7752-shaped JSON snapshots pushed over HTTP.
//!
//! The engine owns snapshot atomicity and the stable `unique` identifiers;
//! this module owns the transport. Disappeared sessions are simply absent
//! from the next snapshot.

use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::netmon::Iface;
use crate::session::Session;
use crate::wire::{IpEncap, MplsEncap};

#[derive(Debug, Serialize)]
pub struct AddressReport {
    pub address: String,
    pub prefix_len: u8,
    pub scope: &'static str,
}

#[derive(Debug, Serialize)]
pub struct IfaceReport {
    pub index: u32,
    pub name: String,
    pub mac: String,
    pub mtu: u32,
    pub addresses: Vec<AddressReport>,
}

#[derive(Debug, Serialize)]
pub struct EncapReport {
    pub address: String,
    pub prefix_len: u8,
    pub primary: bool,
    pub loopback: bool,
}

#[derive(Debug, Serialize)]
pub struct MplsEncapReport {
    pub labels: Vec<String>,
    pub address: String,
    pub prefix_len: u8,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub interface: u32,
    pub peer_mac: String,
    pub state: String,
    pub peer_local_id: Option<String>,
    pub ipv4: Vec<EncapReport>,
    pub ipv6: Vec<EncapReport>,
    pub mpls: Vec<MplsEncapReport>,
}

/// One atomic view of everything this node knows, for the northbound
/// consumer. `unique` lets the consumer deduplicate pushes.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub unique: Vec<String>,
    pub local_id: String,
    pub interfaces: Vec<IfaceReport>,
    pub sessions: Vec<SessionReport>,
}

impl Snapshot {
    pub fn build<'a>(
        local_id: [u8; 10],
        ifaces: impl Iterator<Item = &'a Iface>,
        sessions: impl Iterator<Item = &'a Session>,
    ) -> Snapshot {
        let interfaces: Vec<IfaceReport> = ifaces
            .map(|iface| IfaceReport {
                index: iface.index,
                name: iface.name.clone(),
                mac: iface.mac.to_string(),
                mtu: iface.mtu,
                addresses: iface
                    .addrs
                    .iter()
                    .map(|a| AddressReport {
                        address: a.addr.to_string(),
                        prefix_len: a.prefix_len,
                        scope: a.scope().as_str(),
                    })
                    .collect(),
            })
            .collect();

        let sessions: Vec<SessionReport> = sessions
            .map(|s| SessionReport {
                interface: s.key.ifindex,
                peer_mac: s.key.mac.to_string(),
                state: format!("{:?}", s.state()),
                peer_local_id: s.peer_local_id.map(hex::encode),
                ipv4: s.peer_snapshot.ipv4.iter().map(ip_encap_report).collect(),
                ipv6: s.peer_snapshot.ipv6.iter().map(ip_encap_report).collect(),
                mpls: s
                    .peer_snapshot
                    .mpls
                    .iter()
                    .map(mpls_encap_report)
                    .collect(),
            })
            .collect();

        let mut unique: Vec<String> = sessions
            .iter()
            .map(|s| format!("{}:{}", s.interface, s.peer_mac))
            .collect();
        unique.sort();

        Snapshot {
            unique,
            local_id: hex::encode(local_id),
            interfaces,
            sessions,
        }
    }
}

fn ip_encap_report(e: &IpEncap) -> EncapReport {
    EncapReport {
        address: e.addr.to_string(),
        prefix_len: e.prefix_len,
        primary: e.is_primary(),
        loopback: e.is_loopback(),
    }
}

fn mpls_encap_report(e: &MplsEncap) -> MplsEncapReport {
    MplsEncapReport {
        labels: e.labels.iter().map(hex::encode).collect(),
        address: e.addr.to_string(),
        prefix_len: e.prefix_len,
    }
}

/// Consumer of engine snapshots.
pub trait Reporter: Send {
    fn push(&self, snapshot: Snapshot);
}

/// POSTs each snapshot as JSON to the configured URL. Failures are logged
/// and dropped; the next change pushes again.
pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpReporter {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

impl Reporter for HttpReporter {
    fn push(&self, snapshot: Snapshot) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&snapshot).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("northbound push ok ({} sessions)", snapshot.sessions.len());
                }
                Ok(resp) => warn!("northbound push rejected: HTTP {}", resp.status()),
                Err(e) => warn!("northbound push failed: {e}"),
            }
        });
    }
}

/// Used when no northbound URL is configured.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn push(&self, snapshot: Snapshot) {
        debug!(
            "snapshot: {} interfaces, {} sessions",
            snapshot.interfaces.len(),
            snapshot.sessions.len()
        );
    }
}
