//! LSOE wire protocol: canonical constants, PDU definitions, and the
//! bit-exact codec.
//!
//! Every PDU starts with a 4-byte common header {version, type, length}
//! with all multi-byte integers in network order. Decoding reads through
//! [`ByteReader`], an immutable cursor that fails with `Malformed` on any
//! short read; encoding appends through [`ByteWriter`]. The two are
//! deliberately distinct types.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::ProtocolError;

// ============================================================================
// Wire constants
// ============================================================================

/// LSOE protocol version zero.
pub const LSOE_VERSION: u8 = 0;

/// IEEE Local Experimental EtherType 1, the default LSOE EtherType.
pub const ETH_P_LSOE: u16 = 0x88B5;

/// Common PDU header size: version(1) + type(1) + length(2).
pub const PDU_HDR_LEN: usize = 4;

/// Default HELLO destination: nearest-bridge scoped multicast.
pub const HELLO_MACADDR_DEFAULT: MacAddr =
    MacAddr([0x01, 0x80, 0xC2, 0x00, 0x00, 0x0E]);

/// Encapsulation entry flag: address is the primary one for its family.
pub const ENCAP_FLAG_PRIMARY: u8 = 0x80;
/// Encapsulation entry flag: address sits on a loopback interface.
pub const ENCAP_FLAG_LOOPBACK: u8 = 0x40;
const ENCAP_FLAGS_MASK: u8 = ENCAP_FLAG_PRIMARY | ENCAP_FLAG_LOOPBACK;

// ============================================================================
// Low-level data types
// ============================================================================

/// 6-byte IEEE 802 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Multicast bit of the first octet.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for MacAddr {
    type Err = ProtocolError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ProtocolError::malformed(format!("bad MAC address {s:?}")));
        }
        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            mac[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ProtocolError::malformed(format!("bad MAC address {s:?}")))?;
        }
        Ok(MacAddr(mac))
    }
}

// ============================================================================
// Codec buffer types
// ============================================================================

/// Immutable decoding cursor over a received byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::malformed(format!(
                "need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Remaining bytes, consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::malformed(format!(
                "{} trailing bytes after PDU body",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Appendable encoding buffer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_slice(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ============================================================================
// PDU types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    Hello = 1,
    Open = 2,
    Keepalive = 3,
    Ack = 4,
    Ipv4Encap = 5,
    Ipv6Encap = 6,
    MplsEncap = 7,
    Vendor = 8,
    Error = 9,
    Close = 10,
}

impl PduType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PduType::Hello),
            2 => Some(PduType::Open),
            3 => Some(PduType::Keepalive),
            4 => Some(PduType::Ack),
            5 => Some(PduType::Ipv4Encap),
            6 => Some(PduType::Ipv6Encap),
            7 => Some(PduType::MplsEncap),
            8 => Some(PduType::Vendor),
            9 => Some(PduType::Error),
            10 => Some(PduType::Close),
            _ => None,
        }
    }

    /// Every type except HELLO and ACK carries an ack-id and is acknowledged.
    pub fn is_acknowledgeable(self) -> bool {
        !matches!(self, PduType::Hello | PduType::Ack)
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PduType::Hello => "HELLO",
            PduType::Open => "OPEN",
            PduType::Keepalive => "KEEPALIVE",
            PduType::Ack => "ACK",
            PduType::Ipv4Encap => "IPV4-ENCAPSULATION",
            PduType::Ipv6Encap => "IPV6-ENCAPSULATION",
            PduType::MplsEncap => "MPLS-ENCAPSULATION",
            PduType::Vendor => "VENDOR",
            PduType::Error => "ERROR",
            PduType::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// ERROR PDU codes. Malformed, version-mismatch, and missing-mandatory-field
/// are fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    MalformedPdu = 1,
    VersionMismatch = 2,
    MissingMandatoryField = 3,
    VendorRejected = 4,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::MalformedPdu),
            2 => Some(ErrorCode::VersionMismatch),
            3 => Some(ErrorCode::MissingMandatoryField),
            4 => Some(ErrorCode::VendorRejected),
            _ => None,
        }
    }

    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorCode::VendorRejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPdu {
    /// Sender's MAC on the transmitting interface.
    pub mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPdu {
    pub ack_id: u32,
    /// Distinguishes a peer restart from a duplicate OPEN.
    pub nonce: [u8; 4],
    /// Opaque 10-byte router identifier.
    pub local_id: [u8; 10],
    /// Advertised hold time in seconds; the minimum of the two sides wins.
    pub hold_time: u16,
    pub attributes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePdu {
    pub ack_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPdu {
    pub acked_type: PduType,
    pub ack_id: u32,
}

/// One advertised IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpEncap {
    pub flags: u8,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpEncap {
    pub fn is_primary(&self) -> bool {
        self.flags & ENCAP_FLAG_PRIMARY != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & ENCAP_FLAG_LOOPBACK != 0
    }
}

/// One advertised MPLS label stack bound to an IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsEncap {
    pub flags: u8,
    pub labels: Vec<[u8; 3]>,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapPdu {
    pub ack_id: u32,
    pub entries: Vec<IpEncap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsEncapPdu {
    pub ack_id: u32,
    pub entries: Vec<MplsEncap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorPdu {
    pub ack_id: u32,
    /// IANA enterprise number; unknown numbers are ACKed and discarded.
    pub enterprise: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPdu {
    pub ack_id: u32,
    pub code: ErrorCode,
    pub detail: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePdu {
    pub ack_id: u32,
}

/// Closed tagged union over every PDU kind. Vendor extensions are the sole
/// open point, keyed by enterprise number into the engine's handler registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Hello(HelloPdu),
    Open(OpenPdu),
    Keepalive(KeepalivePdu),
    Ack(AckPdu),
    Ipv4Encap(EncapPdu),
    Ipv6Encap(EncapPdu),
    MplsEncap(MplsEncapPdu),
    Vendor(VendorPdu),
    Error(ErrorPdu),
    Close(ClosePdu),
}

impl Pdu {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::Hello(_) => PduType::Hello,
            Pdu::Open(_) => PduType::Open,
            Pdu::Keepalive(_) => PduType::Keepalive,
            Pdu::Ack(_) => PduType::Ack,
            Pdu::Ipv4Encap(_) => PduType::Ipv4Encap,
            Pdu::Ipv6Encap(_) => PduType::Ipv6Encap,
            Pdu::MplsEncap(_) => PduType::MplsEncap,
            Pdu::Vendor(_) => PduType::Vendor,
            Pdu::Error(_) => PduType::Error,
            Pdu::Close(_) => PduType::Close,
        }
    }

    /// The per-session ack identifier, for every acknowledgeable kind.
    pub fn ack_id(&self) -> Option<u32> {
        match self {
            Pdu::Hello(_) | Pdu::Ack(_) => None,
            Pdu::Open(p) => Some(p.ack_id),
            Pdu::Keepalive(p) => Some(p.ack_id),
            Pdu::Ipv4Encap(p) | Pdu::Ipv6Encap(p) => Some(p.ack_id),
            Pdu::MplsEncap(p) => Some(p.ack_id),
            Pdu::Vendor(p) => Some(p.ack_id),
            Pdu::Error(p) => Some(p.ack_id),
            Pdu::Close(p) => Some(p.ack_id),
        }
    }

    pub fn set_ack_id(&mut self, id: u32) {
        match self {
            Pdu::Hello(_) | Pdu::Ack(_) => {}
            Pdu::Open(p) => p.ack_id = id,
            Pdu::Keepalive(p) => p.ack_id = id,
            Pdu::Ipv4Encap(p) | Pdu::Ipv6Encap(p) => p.ack_id = id,
            Pdu::MplsEncap(p) => p.ack_id = id,
            Pdu::Vendor(p) => p.ack_id = id,
            Pdu::Error(p) => p.ack_id = id,
            Pdu::Close(p) => p.ack_id = id,
        }
    }

    // ------------------------------------------------------------------
    // Encode
    // ------------------------------------------------------------------

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = ByteWriter::new();
        match self {
            Pdu::Hello(p) => {
                body.put_slice(&p.mac.octets());
            }
            Pdu::Open(p) => {
                if p.attributes.len() > u8::MAX as usize {
                    return Err(ProtocolError::malformed("OPEN attributes too long"));
                }
                body.put_u32(p.ack_id);
                body.put_slice(&p.nonce);
                body.put_slice(&p.local_id);
                body.put_u16(p.hold_time);
                body.put_u8(p.attributes.len() as u8);
                body.put_slice(&p.attributes);
                body.put_u16(0); // auth length; the signed variant is not defined yet
            }
            Pdu::Keepalive(p) => {
                body.put_u32(p.ack_id);
            }
            Pdu::Ack(p) => {
                body.put_u8(p.acked_type as u8);
                body.put_u32(p.ack_id);
            }
            Pdu::Ipv4Encap(p) | Pdu::Ipv6Encap(p) => {
                body.put_u32(p.ack_id);
                encode_ip_encaps(&mut body, &p.entries, self.pdu_type())?;
            }
            Pdu::MplsEncap(p) => {
                if p.entries.len() > u16::MAX as usize {
                    return Err(ProtocolError::malformed("too many encapsulations"));
                }
                body.put_u32(p.ack_id);
                body.put_u16(p.entries.len() as u16);
                for e in &p.entries {
                    if e.labels.len() > u8::MAX as usize {
                        return Err(ProtocolError::malformed("MPLS label stack too deep"));
                    }
                    body.put_u8(e.flags);
                    body.put_u8(e.labels.len() as u8);
                    for label in &e.labels {
                        body.put_slice(label);
                    }
                    match e.addr {
                        IpAddr::V4(a) => {
                            body.put_u8(4);
                            body.put_slice(&a.octets());
                        }
                        IpAddr::V6(a) => {
                            body.put_u8(16);
                            body.put_slice(&a.octets());
                        }
                    }
                    body.put_u8(e.prefix_len);
                }
            }
            Pdu::Vendor(p) => {
                body.put_u32(p.ack_id);
                body.put_u32(p.enterprise);
                body.put_slice(&p.body);
            }
            Pdu::Error(p) => {
                if p.detail.len() > u16::MAX as usize {
                    return Err(ProtocolError::malformed("ERROR detail too long"));
                }
                body.put_u32(p.ack_id);
                body.put_u16(p.code as u16);
                body.put_u16(p.detail.len() as u16);
                body.put_slice(&p.detail);
            }
            Pdu::Close(p) => {
                body.put_u32(p.ack_id);
            }
        }

        let total = PDU_HDR_LEN + body.len();
        if total > u16::MAX as usize {
            return Err(ProtocolError::malformed("PDU exceeds length field"));
        }
        let mut out = ByteWriter::new();
        out.put_u8(LSOE_VERSION);
        out.put_u8(self.pdu_type() as u8);
        out.put_u16(total as u16);
        out.put_slice(&body.into_bytes());
        Ok(out.into_bytes())
    }

    // ------------------------------------------------------------------
    // Decode
    // ------------------------------------------------------------------

    pub fn decode(buf: &[u8]) -> Result<Pdu, ProtocolError> {
        let mut r = ByteReader::new(buf);
        let version = r.u8()?;
        let type_octet = r.u8()?;
        let length = r.u16()? as usize;
        if version != LSOE_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let pdu_type = PduType::from_u8(type_octet)
            .ok_or(ProtocolError::UnknownPduType(type_octet))?;
        if length != buf.len() {
            return Err(ProtocolError::malformed(format!(
                "declared length {length} != actual {}",
                buf.len()
            )));
        }

        let pdu = match pdu_type {
            PduType::Hello => {
                let mac = r.take(6)?;
                Pdu::Hello(HelloPdu {
                    mac: MacAddr(mac.try_into().unwrap()),
                })
            }
            PduType::Open => {
                let ack_id = r.u32()?;
                let nonce: [u8; 4] = r.take(4)?.try_into().unwrap();
                let local_id: [u8; 10] = r.take(10)?.try_into().unwrap();
                let hold_time = r.u16()?;
                let attr_len = r.u8()? as usize;
                let attributes = r.take(attr_len)?.to_vec();
                let auth_len = r.u16()?;
                if auth_len != 0 {
                    // Reserved until the signed variant is specified.
                    return Err(ProtocolError::malformed("nonzero auth length"));
                }
                Pdu::Open(OpenPdu {
                    ack_id,
                    nonce,
                    local_id,
                    hold_time,
                    attributes,
                })
            }
            PduType::Keepalive => Pdu::Keepalive(KeepalivePdu { ack_id: r.u32()? }),
            PduType::Ack => {
                let acked_octet = r.u8()?;
                let acked_type = PduType::from_u8(acked_octet)
                    .ok_or_else(|| ProtocolError::malformed("ACK of unknown PDU type"))?;
                if !acked_type.is_acknowledgeable() {
                    return Err(ProtocolError::malformed(format!(
                        "ACK of un-ACKed PDU type {acked_type}"
                    )));
                }
                Pdu::Ack(AckPdu {
                    acked_type,
                    ack_id: r.u32()?,
                })
            }
            PduType::Ipv4Encap => {
                let ack_id = r.u32()?;
                let entries = decode_ip_encaps(&mut r, 4)?;
                Pdu::Ipv4Encap(EncapPdu { ack_id, entries })
            }
            PduType::Ipv6Encap => {
                let ack_id = r.u32()?;
                let entries = decode_ip_encaps(&mut r, 16)?;
                Pdu::Ipv6Encap(EncapPdu { ack_id, entries })
            }
            PduType::MplsEncap => {
                let ack_id = r.u32()?;
                let count = r.u16()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let flags = check_encap_flags(r.u8()?)?;
                    let label_count = r.u8()? as usize;
                    let mut labels = Vec::with_capacity(label_count);
                    for _ in 0..label_count {
                        labels.push(r.take(3)?.try_into().unwrap());
                    }
                    let addr_len = r.u8()?;
                    let addr = match addr_len {
                        4 => IpAddr::V4(Ipv4Addr::from(
                            <[u8; 4]>::try_from(r.take(4)?).unwrap(),
                        )),
                        16 => IpAddr::V6(Ipv6Addr::from(
                            <[u8; 16]>::try_from(r.take(16)?).unwrap(),
                        )),
                        n => {
                            return Err(ProtocolError::malformed(format!(
                                "bad MPLS address length {n}"
                            )))
                        }
                    };
                    let prefix_len = check_prefix_len(r.u8()?, addr)?;
                    entries.push(MplsEncap {
                        flags,
                        labels,
                        addr,
                        prefix_len,
                    });
                }
                Pdu::MplsEncap(MplsEncapPdu { ack_id, entries })
            }
            PduType::Vendor => {
                let ack_id = r.u32()?;
                let enterprise = r.u32()?;
                // Opaque pass-through: the body is not interpreted here.
                let body = r.rest().to_vec();
                Pdu::Vendor(VendorPdu {
                    ack_id,
                    enterprise,
                    body,
                })
            }
            PduType::Error => {
                let ack_id = r.u32()?;
                let code_raw = r.u16()?;
                let code = ErrorCode::from_u16(code_raw).ok_or_else(|| {
                    ProtocolError::malformed(format!("unknown error code {code_raw}"))
                })?;
                let detail_len = r.u16()? as usize;
                let detail = r.take(detail_len)?.to_vec();
                Pdu::Error(ErrorPdu {
                    ack_id,
                    code,
                    detail,
                })
            }
            PduType::Close => Pdu::Close(ClosePdu { ack_id: r.u32()? }),
        };

        r.expect_end()?;
        Ok(pdu)
    }
}

fn encode_ip_encaps(
    w: &mut ByteWriter,
    entries: &[IpEncap],
    pdu_type: PduType,
) -> Result<(), ProtocolError> {
    if entries.len() > u16::MAX as usize {
        return Err(ProtocolError::malformed("too many encapsulations"));
    }
    w.put_u16(entries.len() as u16);
    for e in entries {
        match (e.addr, pdu_type) {
            (IpAddr::V4(a), PduType::Ipv4Encap) => {
                w.put_u8(e.flags);
                w.put_slice(&a.octets());
            }
            (IpAddr::V6(a), PduType::Ipv6Encap) => {
                w.put_u8(e.flags);
                w.put_slice(&a.octets());
            }
            _ => {
                return Err(ProtocolError::malformed(
                    "address family does not match encapsulation PDU type",
                ))
            }
        }
        w.put_u8(e.prefix_len);
    }
    Ok(())
}

fn decode_ip_encaps(
    r: &mut ByteReader<'_>,
    addr_len: usize,
) -> Result<Vec<IpEncap>, ProtocolError> {
    let count = r.u16()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = check_encap_flags(r.u8()?)?;
        let addr = if addr_len == 4 {
            IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(r.take(4)?).unwrap()))
        } else {
            IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(r.take(16)?).unwrap()))
        };
        let prefix_len = check_prefix_len(r.u8()?, addr)?;
        entries.push(IpEncap {
            flags,
            addr,
            prefix_len,
        });
    }
    Ok(entries)
}

fn check_encap_flags(flags: u8) -> Result<u8, ProtocolError> {
    if flags & !ENCAP_FLAGS_MASK != 0 {
        return Err(ProtocolError::malformed(format!(
            "reserved encapsulation flag bits set: {flags:#04x}"
        )));
    }
    Ok(flags)
}

fn check_prefix_len(prefix_len: u8, addr: IpAddr) -> Result<u8, ProtocolError> {
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix_len > max {
        return Err(ProtocolError::malformed(format!(
            "prefix length {prefix_len} too long for address family"
        )));
    }
    Ok(prefix_len)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pdu: Pdu) {
        let bytes = pdu.encode().expect("encode");
        let decoded = Pdu::decode(&bytes).expect("decode");
        assert_eq!(pdu, decoded);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        assert_eq!(mac.octets(), [2, 0, 0, 0, 0, 1]);
        assert_eq!(mac.to_string(), "02:00:00:00:00:01");

        let dashed: MacAddr = "01-80-C2-00-00-0E".parse().unwrap();
        assert_eq!(dashed, HELLO_MACADDR_DEFAULT);
        assert!(dashed.is_multicast());

        assert!("02:00:00:00:01".parse::<MacAddr>().is_err());
        assert!("zz:00:00:00:00:01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_roundtrip_every_pdu_kind() {
        roundtrip(Pdu::Hello(HelloPdu {
            mac: MacAddr([2, 0, 0, 0, 0, 1]),
        }));
        roundtrip(Pdu::Open(OpenPdu {
            ack_id: 7,
            nonce: [1, 2, 3, 4],
            local_id: [9; 10],
            hold_time: 40,
            attributes: vec![0xAA, 0xBB],
        }));
        roundtrip(Pdu::Keepalive(KeepalivePdu { ack_id: 12 }));
        roundtrip(Pdu::Ack(AckPdu {
            acked_type: PduType::Open,
            ack_id: 7,
        }));
        roundtrip(Pdu::Ipv4Encap(EncapPdu {
            ack_id: 3,
            entries: vec![IpEncap {
                flags: ENCAP_FLAG_PRIMARY,
                addr: "10.0.0.1".parse().unwrap(),
                prefix_len: 24,
            }],
        }));
        roundtrip(Pdu::Ipv6Encap(EncapPdu {
            ack_id: 4,
            entries: vec![IpEncap {
                flags: ENCAP_FLAG_LOOPBACK,
                addr: "2001:db8::1".parse().unwrap(),
                prefix_len: 64,
            }],
        }));
        roundtrip(Pdu::MplsEncap(MplsEncapPdu {
            ack_id: 5,
            entries: vec![MplsEncap {
                flags: 0,
                labels: vec![[0, 1, 2], [3, 4, 5]],
                addr: "192.0.2.1".parse().unwrap(),
                prefix_len: 32,
            }],
        }));
        roundtrip(Pdu::Vendor(VendorPdu {
            ack_id: 6,
            enterprise: 12345,
            body: vec![1, 2, 3, 4, 5],
        }));
        roundtrip(Pdu::Error(ErrorPdu {
            ack_id: 8,
            code: ErrorCode::MalformedPdu,
            detail: b"count overrun".to_vec(),
        }));
        roundtrip(Pdu::Close(ClosePdu { ack_id: 9 }));
    }

    #[test]
    fn test_empty_encapsulation_list_roundtrips() {
        roundtrip(Pdu::MplsEncap(MplsEncapPdu {
            ack_id: 1,
            entries: Vec::new(),
        }));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = Pdu::Keepalive(KeepalivePdu { ack_id: 1 })
            .encode()
            .unwrap();
        bytes[0] = 9;
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::VersionMismatch(9))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Pdu::Keepalive(KeepalivePdu { ack_id: 1 })
            .encode()
            .unwrap();
        bytes[1] = 200;
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::UnknownPduType(200))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = Pdu::Keepalive(KeepalivePdu { ack_id: 1 })
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_count_overrun() {
        // IPv4 encapsulation PDU declaring two entries but carrying one.
        let pdu = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 1,
            entries: vec![IpEncap {
                flags: 0,
                addr: "10.0.0.1".parse().unwrap(),
                prefix_len: 32,
            }],
        });
        let mut bytes = pdu.encode().unwrap();
        // Count field sits right after the 4-byte header and 4-byte ack id.
        bytes[9] = 2;
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_reserved_flag_bits() {
        let pdu = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 1,
            entries: vec![IpEncap {
                flags: 0,
                addr: "10.0.0.1".parse().unwrap(),
                prefix_len: 32,
            }],
        });
        let mut bytes = pdu.encode().unwrap();
        bytes[10] = 0x01; // reserved bit in the first entry's flags
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_nonzero_auth_length() {
        let pdu = Pdu::Open(OpenPdu {
            ack_id: 1,
            nonce: [0; 4],
            local_id: [1; 10],
            hold_time: 40,
            attributes: Vec::new(),
        });
        let mut bytes = pdu.encode().unwrap();
        let n = bytes.len();
        bytes[n - 1] = 8; // auth length trailer
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_ack_of_unackable_type_rejected() {
        let bytes = vec![LSOE_VERSION, PduType::Ack as u8, 0, 9, PduType::Hello as u8, 0, 0, 0, 1];
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_vendor_body_is_opaque() {
        // Arbitrary bytes survive untouched, whatever they contain.
        let pdu = Pdu::Vendor(VendorPdu {
            ack_id: 2,
            enterprise: 99,
            body: vec![0xFF, 0x00, 0xDE, 0xAD],
        });
        let bytes = pdu.encode().unwrap();
        match Pdu::decode(&bytes).unwrap() {
            Pdu::Vendor(v) => {
                assert_eq!(v.enterprise, 99);
                assert_eq!(v.body, vec![0xFF, 0x00, 0xDE, 0xAD]);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn test_family_mismatch_rejected_on_encode() {
        let pdu = Pdu::Ipv4Encap(EncapPdu {
            ack_id: 1,
            entries: vec![IpEncap {
                flags: 0,
                addr: "2001:db8::1".parse().unwrap(),
                prefix_len: 64,
            }],
        });
        assert!(pdu.encode().is_err());
    }
}
