//! Test doubles for the external collaborators: a miniature protocol engine and a
//! no-op TLS provider, wired in at the same trait seam a real ngtcp2-style engine
//! would use.
//!
//! The engine speaks QUIC-invariant headers on the wire (so the endpoint
//! demultiplexer sees real long/short headers and CIDs) with a toy frame set inside:
//! HELLO for the handshake, STREAM/ACK for reliable ordered stream data, CLOSE for
//! connection close, DGRAM for unreliable datagrams. Loopback delivery is in-order,
//! so no retransmission machinery is needed.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes};

use quicnet::engine::{
    ConnectionParams, EngineError, EngineFactory, EngineHooks, Event, ProtocolEngine,
    WriteOutcome,
};
use quicnet::tls::{Level, TlsCreds, TlsError, TlsSession};
use quicnet::{Address, ConnectionId, Direction, EcnCodepoint, Path};

const FRAME_STREAM: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;
const FRAME_CLOSE: u8 = 0x03;
const FRAME_DGRAM: u8 = 0x04;
const FRAME_HELLO: u8 = 0x05;

const PAYLOAD_BUDGET: usize = 1200;
const STREAM_FRAME_OVERHEAD: usize = 1 + 8 + 8 + 1 + 2;
const MAX_BIDI_STREAMS: u64 = 32;

pub struct TestEngine {
    dir: Direction,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    session: Option<Box<dyn TlsSession>>,

    hs_sent: bool,
    hs_done: bool,
    hs_reply_pending: bool,
    closing: bool,

    opened: u64,
    tx_offset: BTreeMap<i64, u64>,
    tx_acked: BTreeMap<i64, u64>,
    fin_at: BTreeMap<i64, u64>,
    tx_closed: BTreeSet<i64>,

    rx_expected: BTreeMap<i64, u64>,
    pending_acks: BTreeMap<i64, u64>,
}

impl TestEngine {
    fn new(params: ConnectionParams) -> Self {
        Self {
            dir: params.direction,
            local_cid: params.local_cid,
            remote_cid: params.remote_cid,
            session: None,
            hs_sent: false,
            hs_done: params.direction == Direction::Inbound,
            hs_reply_pending: false,
            closing: false,
            opened: 0,
            tx_offset: BTreeMap::new(),
            tx_acked: BTreeMap::new(),
            fin_at: BTreeMap::new(),
            tx_closed: BTreeSet::new(),
            rx_expected: BTreeMap::new(),
            pending_acks: BTreeMap::new(),
        }
    }

    /// Long Initial header carrying both CIDs, as the endpoint demultiplexer expects.
    fn initial_header(&self, out: &mut Vec<u8>) {
        out.put_u8(0xc0);
        out.put_u32(1);
        out.put_u8(self.remote_cid.len() as u8);
        out.put_slice(self.remote_cid.as_bytes());
        out.put_u8(self.local_cid.len() as u8);
        out.put_slice(self.local_cid.as_bytes());
    }

    /// Short header: flags byte plus the peer's CID at full length.
    fn short_header(&self, out: &mut Vec<u8>) {
        out.put_u8(0x40);
        out.put_slice(self.remote_cid.as_bytes());
    }

    fn peer_initiated(&self, id: i64) -> bool {
        match self.dir {
            Direction::Outbound => id & 0x3 == 0x1,
            Direction::Inbound => id & 0x3 == 0x0,
        }
    }

    fn ack_frames(&mut self, out: &mut Vec<u8>) {
        for (id, cum) in std::mem::take(&mut self.pending_acks) {
            out.put_u8(FRAME_ACK);
            out.put_i64(id);
            out.put_u64(cum);
        }
    }

    fn finish_packet(buf: &mut [u8], pkt: Vec<u8>) -> Result<WriteOutcome, EngineError> {
        if pkt.len() > buf.len() {
            return Err(EngineError::new(0, "scratch buffer too small"));
        }
        buf[..pkt.len()].copy_from_slice(&pkt);
        Ok(WriteOutcome::Packet {
            len: pkt.len(),
            consumed: 0,
        })
    }
}

impl ProtocolEngine for TestEngine {
    fn bind_tls(&mut self, session: Box<dyn TlsSession>) {
        self.session = Some(session);
    }

    fn read_packet(
        &mut self,
        _now: Instant,
        _path: &Path,
        data: &[u8],
        _ecn: Option<EcnCodepoint>,
    ) -> Result<Vec<Event>, EngineError> {
        let mut buf = data;
        if buf.remaining() < 1 {
            return Err(EngineError::new(0, "empty packet"));
        }
        let first = buf.get_u8();
        if first & 0x80 != 0 {
            if buf.remaining() < 4 {
                return Err(EngineError::new(0, "truncated long header"));
            }
            buf.advance(4);
            for _ in 0..2 {
                let len = buf.get_u8() as usize;
                buf.advance(len);
            }
        } else {
            buf.advance(self.local_cid.len());
        }

        let mut events = Vec::new();
        while buf.has_remaining() {
            match buf.get_u8() {
                FRAME_HELLO => {
                    if self.dir == Direction::Inbound {
                        if !self.hs_reply_pending && !self.hs_sent {
                            self.hs_reply_pending = true;
                            events.push(Event::HandshakeCompleted);
                        }
                    } else if !self.hs_done {
                        self.hs_done = true;
                        events.push(Event::HandshakeCompleted);
                    }
                }
                FRAME_STREAM => {
                    let id = buf.get_i64();
                    let offset = buf.get_u64();
                    let fin = buf.get_u8() != 0;
                    let len = buf.get_u16() as usize;
                    let payload = buf.copy_to_bytes(len);

                    let fresh = !self.rx_expected.contains_key(&id);
                    let expected = self.rx_expected.entry(id).or_insert(0);
                    if offset == *expected {
                        *expected += len as u64;
                        let cum = *expected;
                        self.pending_acks.insert(id, cum);
                        if fresh && self.peer_initiated(id) {
                            events.push(Event::StreamOpened { id });
                        }
                        if !payload.is_empty() {
                            events.push(Event::StreamData {
                                id,
                                data: payload,
                                fin,
                            });
                        }
                        if fin {
                            events.push(Event::StreamClosed { id, app_code: 0 });
                        }
                    } else if offset < *expected {
                        // Duplicate; re-acknowledge so the sender retires it.
                        let cum = *expected;
                        self.pending_acks.insert(id, cum);
                    }
                    // A gap would mean loopback reordering; drop and let the test fail.
                }
                FRAME_ACK => {
                    let id = buf.get_i64();
                    let cum = buf.get_u64();
                    let prev = self.tx_acked.entry(id).or_insert(0);
                    if cum > *prev {
                        let delta = (cum - *prev) as usize;
                        *prev = cum;
                        events.push(Event::StreamAcked { id, bytes: delta });
                    }
                    if self.fin_at.get(&id).is_some_and(|&f| cum >= f)
                        && self.tx_closed.insert(id)
                    {
                        events.push(Event::StreamClosed { id, app_code: 0 });
                    }
                }
                FRAME_CLOSE => {
                    let code = buf.get_u64();
                    self.closing = true;
                    events.push(Event::ConnectionClosed { code });
                    break;
                }
                FRAME_DGRAM => {
                    let len = buf.get_u16() as usize;
                    events.push(Event::Datagram(buf.copy_to_bytes(len)));
                }
                _ => return Err(EngineError::new(0, "unknown frame")),
            }
        }
        Ok(events)
    }

    fn writev_stream(
        &mut self,
        _now: Instant,
        _path: &Path,
        buf: &mut [u8],
        stream_id: Option<i64>,
        data: &[&[u8]],
        fin: bool,
    ) -> Result<WriteOutcome, EngineError> {
        if self.closing {
            return Ok(WriteOutcome::Closing);
        }

        let Some(id) = stream_id else {
            // Non-stream pass: handshake and ACK frames.
            let mut pkt = Vec::new();
            if self.dir == Direction::Outbound && !self.hs_sent {
                self.initial_header(&mut pkt);
                pkt.put_u8(FRAME_HELLO);
                self.ack_frames(&mut pkt);
                self.hs_sent = true;
                return Self::finish_packet(buf, pkt);
            }
            if self.hs_reply_pending || !self.pending_acks.is_empty() {
                self.short_header(&mut pkt);
                if self.hs_reply_pending {
                    pkt.put_u8(FRAME_HELLO);
                    self.hs_reply_pending = false;
                    self.hs_sent = true;
                }
                self.ack_frames(&mut pkt);
                return Self::finish_packet(buf, pkt);
            }
            return Ok(WriteOutcome::Congested);
        };

        if !self.hs_done {
            // Stream data waits for the handshake.
            return Ok(WriteOutcome::StreamDataBlocked);
        }
        if self.tx_closed.contains(&id) {
            return Ok(WriteOutcome::StreamShutdown);
        }

        let mut pkt = Vec::new();
        self.short_header(&mut pkt);
        self.ack_frames(&mut pkt);

        let total: usize = data.iter().map(|d| d.len()).sum();
        let budget = PAYLOAD_BUDGET
            .min(buf.len())
            .saturating_sub(pkt.len() + STREAM_FRAME_OVERHEAD);
        let take = total.min(budget).min(u16::MAX as usize);
        if take == 0 && !fin {
            return Ok(WriteOutcome::StreamDataBlocked);
        }
        let fin_now = fin && take == total;

        let offset = *self.tx_offset.get(&id).unwrap_or(&0);
        pkt.put_u8(FRAME_STREAM);
        pkt.put_i64(id);
        pkt.put_u64(offset);
        pkt.put_u8(fin_now as u8);
        pkt.put_u16(take as u16);
        let mut remaining = take;
        for slice in data {
            if remaining == 0 {
                break;
            }
            let n = slice.len().min(remaining);
            pkt.put_slice(&slice[..n]);
            remaining -= n;
        }

        self.tx_offset.insert(id, offset + take as u64);
        if fin_now {
            self.fin_at.insert(id, offset + take as u64);
        }

        let len = pkt.len();
        Self::finish_packet(buf, pkt)?;
        Ok(WriteOutcome::Packet {
            len,
            consumed: take,
        })
    }

    fn write_datagram(
        &mut self,
        _now: Instant,
        _path: &Path,
        buf: &mut [u8],
        data: &[u8],
    ) -> Result<WriteOutcome, EngineError> {
        if self.closing {
            return Ok(WriteOutcome::Closing);
        }
        if !self.hs_done {
            return Ok(WriteOutcome::Congested);
        }
        let mut pkt = Vec::new();
        self.short_header(&mut pkt);
        pkt.put_u8(FRAME_DGRAM);
        pkt.put_u16(data.len() as u16);
        pkt.put_slice(data);
        Self::finish_packet(buf, pkt)
    }

    fn update_tx_time(&mut self, _now: Instant) {}

    fn expiry(&self) -> Option<Instant> {
        None
    }

    fn handle_expiry(&mut self, _now: Instant) -> Result<Vec<Event>, EngineError> {
        Ok(Vec::new())
    }

    fn max_udp_payload_size(&self) -> usize {
        PAYLOAD_BUDGET
    }

    fn send_quantum(&self) -> usize {
        PAYLOAD_BUDGET * 10
    }

    fn open_bidi_stream(&mut self) -> Result<i64, EngineError> {
        if self.streams_bidi_left() == 0 {
            return Err(EngineError::new(0, "bidirectional stream budget exhausted"));
        }
        let id = match self.dir {
            Direction::Outbound => 4 * self.opened as i64,
            Direction::Inbound => 4 * self.opened as i64 + 1,
        };
        self.opened += 1;
        Ok(id)
    }

    fn streams_bidi_left(&self) -> u64 {
        MAX_BIDI_STREAMS - self.opened.min(MAX_BIDI_STREAMS)
    }

    fn shutdown_stream(&mut self, id: i64, _app_code: u64) {
        self.tx_closed.insert(id);
    }

    fn extend_max_stream_data(&mut self, _id: i64, _n: u64) {}

    fn close(
        &mut self,
        _now: Instant,
        _path: &Path,
        buf: &mut [u8],
        code: u64,
        _reason: &[u8],
    ) -> Result<usize, EngineError> {
        let mut pkt = Vec::new();
        self.short_header(&mut pkt);
        pkt.put_u8(FRAME_CLOSE);
        pkt.put_u64(code);
        self.closing = true;
        let len = pkt.len();
        Self::finish_packet(buf, pkt)?;
        Ok(len)
    }

    fn pto(&self) -> Duration {
        Duration::from_millis(100)
    }
}

pub struct TestEngineFactory;

impl EngineFactory for TestEngineFactory {
    fn new_connection(
        &self,
        params: ConnectionParams,
        _hooks: EngineHooks,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        Ok(Box::new(TestEngine::new(params)))
    }
}

pub struct TestTls;

struct TestSession;

impl TlsSession for TestSession {
    fn client_initial(&mut self) -> Result<Vec<u8>, TlsError> {
        Ok(Vec::new())
    }

    fn recv_client_initial(&mut self, _odcid: &[u8]) -> Result<(), TlsError> {
        Ok(())
    }

    fn recv_crypto_data(
        &mut self,
        _level: Level,
        _data: &[u8],
    ) -> Result<Vec<(Level, Vec<u8>)>, TlsError> {
        Ok(Vec::new())
    }

    fn recv_retry(&mut self, _new_odcid: &[u8]) -> Result<(), TlsError> {
        Ok(())
    }

    fn encrypt(
        &mut self,
        _level: Level,
        _packet_number: u64,
        _header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<usize, TlsError> {
        Ok(payload.len())
    }

    fn decrypt(
        &mut self,
        _level: Level,
        _packet_number: u64,
        _header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<usize, TlsError> {
        Ok(payload.len())
    }

    fn header_protection_mask(
        &mut self,
        _level: Level,
        _sample: &[u8],
    ) -> Result<[u8; 5], TlsError> {
        Ok([0; 5])
    }

    fn update_key(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn discard_keys(&mut self, _level: Level) {}

    fn is_complete(&self) -> bool {
        true
    }

    fn selected_alpn(&self) -> Option<&[u8]> {
        None
    }
}

impl TlsCreds for TestTls {
    fn new_session(
        &self,
        _direction: Direction,
        _alpn: &[Vec<u8>],
    ) -> Result<Box<dyn TlsSession>, TlsError> {
        Ok(Box::new(TestSession))
    }
}

pub fn test_creds() -> Arc<dyn TlsCreds> {
    Arc::new(TestTls)
}

pub fn test_engine() -> Arc<dyn EngineFactory> {
    Arc::new(TestEngineFactory)
}

pub fn localhost(port: u16) -> Address {
    Address::new("127.0.0.1", port).unwrap()
}

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Byte slice as Bytes, copied.
pub fn b(data: &str) -> Bytes {
    Bytes::copy_from_slice(data.as_bytes())
}
