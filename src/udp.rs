use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{trace, warn};
use zeroize::Zeroize;

use crate::types::{Address, EcnCodepoint, Packet, Path};
use crate::{DATAGRAM_BATCH_SIZE, MAX_UDP_PAYLOAD_SIZE};

/// Result of a (batched) send attempt.
#[derive(Debug)]
pub(crate) enum SendStatus {
    /// Every packet hit the wire.
    Sent,
    /// The socket would block; unsent packets remain queued for retry.
    Blocked,
    /// Unrecoverable socket error; the packets were dropped.
    Fatal(io::Error),
}

/// Scratch space a connection packs coalesced QUIC packets into before a batched send.
///
/// Packets sit at fixed [`MAX_UDP_PAYLOAD_SIZE`] stride; `first` advances past packets
/// already on the wire so a blocked batch resumes exactly where it stopped. The buffer
/// may hold handshake secrets in flight, so it is wiped on drop.
pub(crate) struct PacketBatch {
    buf: Box<[u8]>,
    sizes: [usize; DATAGRAM_BATCH_SIZE],
    first: usize,
    count: usize,
    ecn: Option<EcnCodepoint>,
}

impl PacketBatch {
    pub(crate) fn new() -> Self {
        Self {
            buf: vec![0; MAX_UDP_PAYLOAD_SIZE * DATAGRAM_BATCH_SIZE].into_boxed_slice(),
            sizes: [0; DATAGRAM_BATCH_SIZE],
            first: 0,
            count: 0,
            ecn: None,
        }
    }

    /// Writable region for the next packet, or `None` when the batch is full.
    pub(crate) fn scratch(&mut self) -> Option<&mut [u8]> {
        if self.count == DATAGRAM_BATCH_SIZE {
            return None;
        }
        let start = self.count * MAX_UDP_PAYLOAD_SIZE;
        Some(&mut self.buf[start..start + MAX_UDP_PAYLOAD_SIZE])
    }

    /// Commit `len` bytes written into [`scratch`](Self::scratch) as one packet.
    pub(crate) fn commit(&mut self, len: usize, ecn: Option<EcnCodepoint>) {
        debug_assert!(self.count < DATAGRAM_BATCH_SIZE && len <= MAX_UDP_PAYLOAD_SIZE);
        self.sizes[self.count] = len;
        self.count += 1;
        self.ecn = ecn;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first == self.count
    }

    pub(crate) fn clear(&mut self) {
        self.first = 0;
        self.count = 0;
    }

    fn packet(&self, i: usize) -> &[u8] {
        let start = i * MAX_UDP_PAYLOAD_SIZE;
        &self.buf[start..start + self.sizes[i]]
    }
}

impl Drop for PacketBatch {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

struct QueuedSend {
    dest: Address,
    buf: Vec<u8>,
    ecn: Option<EcnCodepoint>,
    cb: Option<Box<dyn FnOnce(&SendStatus) + Send>>,
}

/// Non-blocking UDP socket bound to one endpoint, with ECN marking and a retry FIFO for
/// one-shot control packets.
pub(crate) struct UdpSocket {
    io: tokio::net::UdpSocket,
    local: Address,
    /// TOS byte currently programmed on the socket; outgoing ECN is applied by
    /// reprogramming it when the codepoint changes.
    tos: AtomicU8,
    queued: Mutex<VecDeque<QueuedSend>>,
}

impl UdpSocket {
    /// Bind a non-blocking socket to `local`. Must run on the loop thread (the socket
    /// registers with the loop's reactor).
    pub(crate) fn bind(local: Address) -> io::Result<Self> {
        let addr = local.socket_addr();
        let domain = if local.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let io = tokio::net::UdpSocket::from_std(std_socket)?;
        let local = Address::from(io.local_addr()?);
        Ok(Self {
            io,
            local,
            tos: AtomicU8::new(0),
            queued: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn local(&self) -> Address {
        self.local
    }

    /// Wait until at least one datagram can be read.
    pub(crate) async fn readable(&self) -> io::Result<()> {
        self.io.readable().await
    }

    /// Wait until the socket can accept writes again.
    pub(crate) async fn writable(&self) -> io::Result<()> {
        self.io.writable().await
    }

    /// Pull one datagram if available; `Ok(None)` when the socket would block.
    ///
    /// ECONNRESET is swallowed: it is undefined for QUIC and can be injected by
    /// off-path attackers.
    pub(crate) fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<Packet>> {
        loop {
            match self.io.try_recv_from(buf) {
                Ok((n, remote)) => {
                    return Ok(Some(Packet {
                        path: Path::new(self.local, Address::from(remote)),
                        data: Bytes::copy_from_slice(&buf[..n]),
                        ecn: None,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempt to put every unsent packet of `batch` on the wire.
    ///
    /// On success the batch is emptied. On a blocked socket the batch's cursor points at
    /// the unsent suffix so the exact same bytes are retried later. On a fatal error the
    /// batch is dropped wholesale.
    pub(crate) fn send_batch(&self, dest: Address, batch: &mut PacketBatch) -> SendStatus {
        self.apply_ecn(batch.ecn);
        while batch.first < batch.count {
            match self.io.try_send_to(batch.packet(batch.first), dest.socket_addr()) {
                Ok(_) => batch.first += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(
                        sent = batch.first,
                        pending = batch.count - batch.first,
                        "socket blocked mid-batch"
                    );
                    return SendStatus::Blocked;
                }
                Err(e) => {
                    warn!(%dest, "fatal send error: {e}");
                    batch.clear();
                    return SendStatus::Fatal(e);
                }
            }
        }
        batch.clear();
        SendStatus::Sent
    }

    /// One-shot send for control packets (e.g. Version Negotiation) that must not be
    /// lost to a transiently blocked socket: on EAGAIN the packet is retained and
    /// retried on writability, after which `cb` (if any) observes the final outcome.
    pub(crate) fn send_or_queue(
        &self,
        dest: Address,
        buf: Vec<u8>,
        ecn: Option<EcnCodepoint>,
        cb: Option<Box<dyn FnOnce(&SendStatus) + Send>>,
    ) {
        {
            let mut queue = self.queued.lock().unwrap();
            if !queue.is_empty() {
                // Keep FIFO order behind packets already waiting.
                queue.push_back(QueuedSend { dest, buf, ecn, cb });
                return;
            }
        }
        self.apply_ecn(ecn);
        match self.io.try_send_to(&buf, dest.socket_addr()) {
            Ok(_) => {
                if let Some(cb) = cb {
                    cb(&SendStatus::Sent);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(%dest, "queueing control packet behind blocked socket");
                self.queued
                    .lock()
                    .unwrap()
                    .push_back(QueuedSend { dest, buf, ecn, cb });
            }
            Err(e) => {
                warn!(%dest, "failed to send control packet: {e}");
                if let Some(cb) = cb {
                    cb(&SendStatus::Fatal(e));
                }
            }
        }
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queued.lock().unwrap().is_empty()
    }

    /// Drain the control-packet FIFO as far as the socket allows.
    pub(crate) fn flush_queued(&self) {
        loop {
            let entry = {
                let mut queue = self.queued.lock().unwrap();
                match queue.pop_front() {
                    Some(entry) => entry,
                    None => return,
                }
            };
            self.apply_ecn(entry.ecn);
            match self.io.try_send_to(&entry.buf, entry.dest.socket_addr()) {
                Ok(_) => {
                    if let Some(cb) = entry.cb {
                        cb(&SendStatus::Sent);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.queued.lock().unwrap().push_front(entry);
                    return;
                }
                Err(e) => {
                    warn!(dest = %entry.dest, "dropping queued control packet: {e}");
                    if let Some(cb) = entry.cb {
                        cb(&SendStatus::Fatal(e));
                    }
                }
            }
        }
    }

    fn apply_ecn(&self, ecn: Option<EcnCodepoint>) {
        let bits = ecn.map(EcnCodepoint::bits).unwrap_or(0);
        if self.tos.swap(bits, Ordering::Relaxed) == bits {
            return;
        }
        #[cfg(unix)]
        {
            let sock = socket2::SockRef::from(&self.io);
            let result = if self.local.is_ipv6() {
                sock.set_tclass_v6(bits as u32)
            } else {
                sock.set_tos_v4(bits as u32)
            };
            if let Err(e) = result {
                trace!("failed to set ECN codepoint: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_cursor_advances_and_clears() {
        let mut batch = PacketBatch::new();
        assert!(batch.is_empty());

        let scratch = batch.scratch().unwrap();
        scratch[..3].copy_from_slice(b"abc");
        batch.commit(3, None);
        let scratch = batch.scratch().unwrap();
        scratch[..2].copy_from_slice(b"de");
        batch.commit(2, None);

        assert!(!batch.is_empty());
        assert_eq!(batch.packet(0), b"abc");
        assert_eq!(batch.packet(1), b"de");

        batch.first = 1; // as if one packet went out before EAGAIN
        assert!(!batch.is_empty());
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn batch_capacity_is_bounded() {
        let mut batch = PacketBatch::new();
        for _ in 0..DATAGRAM_BATCH_SIZE {
            assert!(batch.scratch().is_some());
            batch.commit(1, None);
        }
        assert!(batch.scratch().is_none());
    }
}
