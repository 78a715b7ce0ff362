//! Just enough QUIC header parsing to demultiplex datagrams, plus Version Negotiation
//! assembly. Everything past the connection IDs is the engine's business.

use bytes::{Buf, BufMut};
use rand::Rng;

use crate::types::{ConnectionId, MAX_CID_LEN};

/// Long header packet types for version 1, from the two type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// The invariant header fields of a received datagram's first packet.
#[derive(Debug)]
pub(crate) enum Header {
    /// Long header carrying an explicit version and both CIDs.
    Long {
        version: u32,
        ty: LongType,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    /// Version Negotiation (version field zero).
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    /// Short header; only the destination CID is visible, at our fixed local length.
    Short { dcid: ConnectionId },
}

impl Header {
    /// Destination CID: the recipient's chosen CID, i.e. our local CID for routing.
    pub(crate) fn dcid(&self) -> &ConnectionId {
        match self {
            Self::Long { dcid, .. } => dcid,
            Self::VersionNegotiation { dcid, .. } => dcid,
            Self::Short { dcid } => dcid,
        }
    }
}

/// Parse the invariant header of `data`, treating short-header destination CIDs as
/// `local_cid_len` bytes (the length this endpoint mints).
///
/// Returns `None` for datagrams too mangled to route; those are dropped silently per
/// RFC 9000 §5.2.
pub(crate) fn parse_header(data: &[u8], local_cid_len: usize) -> Option<Header> {
    let mut buf = data;
    if buf.remaining() < 1 {
        return None;
    }
    let first = buf.get_u8();

    if first & 0x80 == 0 {
        // Short header: flags byte then our CID.
        if buf.remaining() < local_cid_len {
            return None;
        }
        return Some(Header::Short {
            dcid: ConnectionId::new(&buf[..local_cid_len]),
        });
    }

    if buf.remaining() < 4 {
        return None;
    }
    let version = buf.get_u32();

    let dcid = read_cid(&mut buf)?;
    let scid = read_cid(&mut buf)?;

    if version == 0 {
        return Some(Header::VersionNegotiation { dcid, scid });
    }

    let ty = match (first >> 4) & 0b11 {
        0b00 => LongType::Initial,
        0b01 => LongType::ZeroRtt,
        0b10 => LongType::Handshake,
        _ => LongType::Retry,
    };
    Some(Header::Long {
        version,
        ty,
        dcid,
        scid,
    })
}

fn read_cid(buf: &mut &[u8]) -> Option<ConnectionId> {
    if buf.remaining() < 1 {
        return None;
    }
    let len = buf.get_u8() as usize;
    if len > MAX_CID_LEN || buf.remaining() < len {
        return None;
    }
    let cid = ConnectionId::new(&buf[..len]);
    buf.advance(len);
    Some(cid)
}

/// Build a Version Negotiation packet answering a long-header packet that carried
/// `their_scid`/`their_dcid`, advertising `versions`.
///
/// Per RFC 8999 the reply swaps the CIDs so the initiator can match it to its attempt;
/// the unused bits of the first byte are randomized to resist fingerprinting.
pub(crate) fn version_negotiation(
    their_scid: &ConnectionId,
    their_dcid: &ConnectionId,
    versions: &[u32],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + their_scid.len() + their_dcid.len() + 4 * versions.len());
    out.put_u8(0x80 | rand::thread_rng().gen::<u8>() & 0x7f);
    out.put_u32(0);
    out.put_u8(their_scid.len() as u8);
    out.put_slice(their_scid.as_bytes());
    out.put_u8(their_dcid.len() as u8);
    out.put_slice(their_dcid.as_bytes());
    for &v in versions {
        out.put_u32(v);
    }
    out
}
