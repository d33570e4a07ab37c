//! Raw Ethernet I/O: one AF_PACKET socket per monitored interface.
//!
//! The socket is SOCK_DGRAM, so the kernel strips and builds the 14-byte
//! Ethernet header and addressing happens through `sockaddr_ll`. Frames the
//! kernel flags as our own output are skipped on receive.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::unix::AsyncFd;

use crate::error::ProtocolError;
use crate::wire::MacAddr;

// PF_PACKET packet types from linux/if_packet.h.
const PACKET_OUTGOING: u8 = 4;

/// Raw link-layer socket bound to one interface and EtherType.
pub struct EtherSocket {
    fd: AsyncFd<OwnedFd>,
    ifindex: u32,
    ethertype: u16,
    mtu: usize,
}

impl EtherSocket {
    /// Open, bind to `ifindex`, and join the HELLO multicast group.
    pub fn open(
        ifindex: u32,
        ethertype: u16,
        mtu: usize,
        hello_group: MacAddr,
    ) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                ethertype.to_be() as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = ethertype.to_be();
        sll.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                owned.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
        mreq.mr_ifindex = ifindex as libc::c_int;
        mreq.mr_type = libc::PACKET_MR_MULTICAST as libc::c_ushort;
        mreq.mr_alen = 6;
        mreq.mr_address[..6].copy_from_slice(&hello_group.octets());
        let rc = unsafe {
            libc::setsockopt(
                owned.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(owned)?,
            ifindex,
            ethertype,
            mtu,
        })
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Receive one frame: `(source MAC, length)`. Our own outgoing frames
    /// are skipped. The stream ends with an error once the interface is
    /// gone.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(MacAddr, usize)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_raw(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => match result? {
                    Some(frame) => return Ok(frame),
                    None => continue,
                },
                Err(_would_block) => continue,
            }
        }
    }

    /// Transmit one frame to `dst`. Frames larger than the interface MTU
    /// are rejected before reaching the kernel.
    pub async fn send(&self, dst: MacAddr, frame: &[u8]) -> Result<(), ProtocolError> {
        if frame.len() > self.mtu {
            return Err(ProtocolError::malformed(format!(
                "frame of {} bytes exceeds MTU {}",
                frame.len(),
                self.mtu
            )));
        }
        loop {
            let mut guard = self.fd.writable().await.map_err(ProtocolError::Io)?;
            match guard.try_io(|inner| {
                send_raw(
                    inner.get_ref().as_raw_fd(),
                    self.ifindex,
                    self.ethertype,
                    dst,
                    frame,
                )
            }) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    return Err(match e.raw_os_error() {
                        Some(libc::ENETDOWN) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                            ProtocolError::LinkDown
                        }
                        _ => ProtocolError::Io(e),
                    })
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(MacAddr, usize)>> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if addr.sll_pkttype == PACKET_OUTGOING {
        debug!("skipping frame flagged as our own output");
        return Ok(None);
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&addr.sll_addr[..6]);
    Ok(Some((MacAddr(mac), n as usize)))
}

fn send_raw(
    fd: RawFd,
    ifindex: u32,
    ethertype: u16,
    dst: MacAddr,
    frame: &[u8],
) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = ethertype.to_be();
    addr.sll_ifindex = ifindex as libc::c_int;
    addr.sll_halen = 6;
    addr.sll_addr[..6].copy_from_slice(&dst.octets());
    let n = unsafe {
        libc::sendto(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// MAC address cache
// ============================================================================

struct MacEntry {
    ifindex: u32,
    last_seen: Instant,
}

/// Remembers which interface each peer MAC was learned on. A MAC showing up
/// on a different interface is logged and its frames dropped until the old
/// entry ages out.
pub struct MacCache {
    entries: HashMap<MacAddr, MacEntry>,
    timeout: Duration,
}

impl MacCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Record a sighting. Returns false if the MAC is pinned to another
    /// interface.
    pub fn observe(&mut self, mac: MacAddr, ifindex: u32, now: Instant) -> bool {
        match self.entries.get_mut(&mac) {
            Some(entry) if entry.ifindex != ifindex => {
                warn!(
                    "MAC {mac} seen on interface {} but pinned to {}, dropping",
                    ifindex, entry.ifindex
                );
                false
            }
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => {
                debug!("learned MAC {mac} on interface {ifindex}");
                self.entries.insert(
                    mac,
                    MacEntry {
                        ifindex,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drop entries not seen within the cache timeout.
    pub fn purge(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) < timeout);
    }

    /// Forget every MAC pinned to a departed interface.
    pub fn forget_interface(&mut self, ifindex: u32) {
        self.entries.retain(|_, e| e.ifindex != ifindex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_cache_pins_interface() {
        let mut cache = MacCache::new(Duration::from_secs(300));
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        let now = Instant::now();

        assert!(cache.observe(mac, 3, now));
        assert!(cache.observe(mac, 3, now));
        assert!(!cache.observe(mac, 4, now));
    }

    #[test]
    fn test_mac_cache_purge() {
        let mut cache = MacCache::new(Duration::from_secs(300));
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        let start = Instant::now();

        assert!(cache.observe(mac, 3, start));
        cache.purge(start + Duration::from_secs(200));
        // Still pinned.
        assert!(!cache.observe(mac, 4, start + Duration::from_secs(200)));
        cache.purge(start + Duration::from_secs(600));
        // Aged out; free to move.
        assert!(cache.observe(mac, 4, start + Duration::from_secs(600)));
    }

    #[test]
    fn test_mac_cache_forget_interface() {
        let mut cache = MacCache::new(Duration::from_secs(300));
        let a = MacAddr([2, 0, 0, 0, 0, 1]);
        let b = MacAddr([2, 0, 0, 0, 0, 2]);
        let now = Instant::now();

        cache.observe(a, 3, now);
        cache.observe(b, 4, now);
        cache.forget_interface(3);
        assert!(cache.observe(a, 5, now));
        assert!(!cache.observe(b, 5, now));
    }
}
