use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use rand::RngCore;

/// Longest connection ID permitted by RFC 9000.
pub const MAX_CID_LEN: usize = 20;

/// An opaque QUIC connection ID, 0-20 bytes.
///
/// Each peer picks its own IDs; the peer's chosen ID appears in the destination field of
/// packets sent to it, which is what the endpoint demultiplexes on.
#[derive(Clone, Copy, Eq)]
pub struct ConnectionId {
    len: u8,
    data: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Wrap raw CID bytes. Anything past [`MAX_CID_LEN`] is truncated.
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_CID_LEN);
        let mut data = [0; MAX_CID_LEN];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            len: len as u8,
            data,
        }
    }

    /// Generate a fresh random CID of `len` bytes (clamped to [`MAX_CID_LEN`]).
    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CID_LEN);
        let mut data = [0; MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut data[..len]);
        Self {
            len: len as u8,
            data,
        }
    }

    /// The CID bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Number of bytes in the ID.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this is the zero-length CID.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // IDs are random; the first word is as good as hashing all twenty bytes.
        state.write_u64(u64::from_le_bytes(self.data[..8].try_into().unwrap()));
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A local or remote UDP address.
///
/// Thin wrapper over [`SocketAddr`] that also carries the presentation form the public
/// API accepts (host string plus port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    /// Build an address from presentation form. Fails on an unparseable host.
    pub fn new(host: &str, port: u16) -> Result<Self, std::net::AddrParseError> {
        let ip: IpAddr = host.parse()?;
        Ok(Self(SocketAddr::new(ip, port)))
    }

    /// The socket-layer form.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// UDP port.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Whether this is an IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The 4-tuple identifying a QUIC flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    /// Our side of the flow.
    pub local: Address,
    /// The peer's side.
    pub remote: Address,
}

impl Path {
    /// Pair a local and remote address.
    pub fn new(local: Address, remote: Address) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Explicit Congestion Notification codepoint carried per datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EcnCodepoint {
    /// ECN-capable transport, codepoint 0
    Ect0 = 0b10,
    /// ECN-capable transport, codepoint 1
    Ect1 = 0b01,
    /// Congestion experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Decode the low two bits of an IP TOS byte.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b10 => Some(Self::Ect0),
            0b01 => Some(Self::Ect1),
            0b11 => Some(Self::Ce),
            _ => None,
        }
    }

    /// The two-bit wire representation.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// A received UDP datagram plus its flow and metadata. Immutable after reception.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Flow the datagram arrived on (local = our socket, remote = sender).
    pub path: Path,
    /// The raw datagram payload.
    pub data: Bytes,
    /// ECN bits observed on the datagram, if the platform surfaced them.
    pub ecn: Option<EcnCodepoint>,
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The peer reached out to us.
    Inbound,
    /// We reached out to the peer.
    Outbound,
}

impl Direction {
    /// Ingress-classification tag for packets this connection emits.
    pub(crate) fn packet_tag(self) -> u8 {
        match self {
            Self::Outbound => CLIENT_TO_SERVER,
            Self::Inbound => SERVER_TO_CLIENT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

/// Tag on packets emitted by the connection's client side.
pub(crate) const CLIENT_TO_SERVER: u8 = 1;
/// Tag on packets emitted by the connection's server side.
pub(crate) const SERVER_TO_CLIENT: u8 = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    #[test]
    fn cid_equality_is_length_and_bytes() {
        let a = ConnectionId::new(&[1, 2, 3]);
        let b = ConnectionId::new(&[1, 2, 3]);
        let c = ConnectionId::new(&[1, 2, 3, 0]);
        assert_eq!(a, b);
        assert_ne!(a, c, "same prefix but different length must differ");
    }

    #[test]
    fn cid_hashes_first_word() {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]);
        let a = ConnectionId::new(&bytes);
        bytes[12] = 0xff;
        let b = ConnectionId::new(&bytes);

        let hash = |cid: &ConnectionId| {
            let mut h = DefaultHasher::new();
            cid.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn random_cid_respects_len() {
        assert_eq!(ConnectionId::random(8).len(), 8);
        assert_eq!(ConnectionId::random(64).len(), MAX_CID_LEN);
    }

    #[test]
    fn address_roundtrip() {
        let addr = Address::new("127.0.0.1", 5500).unwrap();
        assert_eq!(addr.port(), 5500);
        assert_eq!(addr.to_string(), "127.0.0.1:5500");
        assert!(!addr.is_ipv6());
    }

    #[test]
    fn ecn_bits() {
        assert_eq!(EcnCodepoint::from_bits(0b10), Some(EcnCodepoint::Ect0));
        assert_eq!(EcnCodepoint::from_bits(0b11), Some(EcnCodepoint::Ce));
        assert_eq!(EcnCodepoint::from_bits(0b00), None);
        assert_eq!(EcnCodepoint::Ce.bits(), 0b11);
    }
}
