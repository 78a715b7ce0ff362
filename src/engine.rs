//! Contract between the endpoint core and the external QUIC protocol engine.
//!
//! The engine is the per-connection protocol state machine: packet protection,
//! ACK/loss/idle timers, flow control accounting, and frame assembly. The surface here is
//! modeled on ngtcp2's connection API, reshaped for Rust ownership: where a C engine
//! re-enters its owner through registered callbacks, a [`ProtocolEngine`] instead
//! *returns* [`Event`]s from [`read_packet`](ProtocolEngine::read_packet) and the
//! connection applies them afterwards.
//!
//! The crate constructs engines through an [`EngineFactory`] supplied in the listen or
//! connect options, hands each new engine an [`EngineHooks`] (randomness, connection-ID
//! minting, path challenge data) and binds the TLS session with
//! [`bind_tls`](ProtocolEngine::bind_tls); from then on the engine drives the TLS message
//! exchange internally.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::tls::TlsSession;
use crate::types::{ConnectionId, Direction, EcnCodepoint, Path};

/// A fatal protocol-level failure reported by the engine.
#[derive(Debug, Error)]
#[error("engine error: {reason} (close code {close_code:#x})")]
pub struct EngineError {
    /// The transport close code the engine suggests sending to the peer.
    pub close_code: u64,
    /// Human-readable detail.
    pub reason: String,
}

impl EngineError {
    /// Convenience constructor.
    pub fn new(close_code: u64, reason: impl Into<String>) -> Self {
        Self {
            close_code,
            reason: reason.into(),
        }
    }
}

/// Progress the engine reports while absorbing packets or timer expiry.
#[derive(Debug)]
pub enum Event {
    /// The TLS handshake completed; application data may flow.
    HandshakeCompleted,
    /// The peer opened stream `id`.
    StreamOpened {
        /// Engine-assigned stream id.
        id: i64,
    },
    /// Ordered stream payload arrived.
    StreamData {
        /// Stream the bytes belong to.
        id: i64,
        /// The payload, in stream order.
        data: Bytes,
        /// Whether this is the final payload on the stream.
        fin: bool,
    },
    /// The peer acknowledged `bytes` more bytes of stream data, in order.
    StreamAcked {
        /// Stream the acknowledgement applies to.
        id: i64,
        /// Newly acknowledged byte count.
        bytes: usize,
    },
    /// The stream was closed (reset, STOP_SENDING, or FIN-and-drained).
    StreamClosed {
        /// Stream that closed.
        id: i64,
        /// Application close code carried by the peer, 0 for a clean FIN.
        app_code: u64,
    },
    /// The peer raised our bidirectional stream budget.
    StreamsAvailable {
        /// How many more bidirectional streams we may now open.
        bidi: u64,
    },
    /// An unreliable datagram arrived.
    Datagram(Bytes),
    /// The peer sent CONNECTION_CLOSE; the connection must move to draining.
    ConnectionClosed {
        /// Transport or application close code from the wire.
        code: u64,
    },
}

/// Outcome of asking the engine to assemble a packet with `writev_stream`.
///
/// Mirrors the return-code protocol of ngtcp2's `writev_stream`: a positive write is a
/// finished packet, `WRITE_MORE` means the frame was consumed but the packet has room for
/// coalescing, and the remaining variants are the stream-level short-circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A packet of `len` bytes is in the scratch buffer; `consumed` stream bytes went in.
    Packet {
        /// Datagram payload length produced.
        len: usize,
        /// Stream bytes consumed from the supplied slices.
        consumed: usize,
    },
    /// The frame was absorbed (`consumed` bytes) and the engine wants more coalesced
    /// frames before emitting the packet.
    WriteMore {
        /// Stream bytes consumed from the supplied slices.
        consumed: usize,
    },
    /// Congestion or amplification limited: nothing written, stop the write loop.
    Congested,
    /// The stream is flow-control blocked; drop it from the working set.
    StreamDataBlocked,
    /// The stream's send side is shut (or the stream no longer exists).
    StreamShutdown,
    /// The connection is closing; no further writes will succeed.
    Closing,
}

/// Parameters for constructing a connection-level engine.
#[derive(Debug)]
pub struct ConnectionParams {
    /// Inbound or outbound.
    pub direction: Direction,
    /// Our CID: what the peer will put in the destination field.
    pub local_cid: ConnectionId,
    /// The peer's CID: what we put in the destination field.
    pub remote_cid: ConnectionId,
    /// The 4-tuple of the flow.
    pub path: Path,
    /// ALPN protocols offered (outbound) or accepted (inbound).
    pub alpn: Vec<Vec<u8>>,
    /// QUIC version to speak; always [`crate::SUPPORTED_VERSION`] today.
    pub version: u32,
}

/// Ambient services the connection wires into each engine it constructs.
///
/// These correspond to the non-crypto ngtcp2 callbacks (`rand`,
/// `get_new_connection_id`, `get_path_challenge_data`); the crypto callbacks live on the
/// [`TlsSession`] bound separately.
pub struct EngineHooks {
    /// Fill `dest` with cryptographically random bytes.
    pub rand: Box<dyn FnMut(&mut [u8]) + Send>,
    /// Mint a fresh connection ID of the given length plus its stateless reset token.
    pub new_connection_id: Box<dyn FnMut(usize) -> (ConnectionId, [u8; 16]) + Send>,
    /// Produce 8 bytes of PATH_CHALLENGE payload.
    pub path_challenge: Box<dyn FnMut(&mut [u8; 8]) + Send>,
}

impl std::fmt::Debug for EngineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHooks").finish_non_exhaustive()
    }
}

/// The per-connection QUIC protocol state machine.
///
/// One instance per connection, owned by the connection and only ever driven from the
/// loop thread. All methods take `&mut self`; the engine never runs concurrently with
/// itself.
pub trait ProtocolEngine: Send {
    /// Bind the TLS session after construction. The engine owns the session from here on
    /// and exchanges handshake messages through it until completion.
    fn bind_tls(&mut self, session: Box<dyn TlsSession>);

    /// Absorb one received datagram; returns the protocol progress it caused.
    ///
    /// A returned error is fatal for the connection; the caller closes with the
    /// engine-suggested code.
    fn read_packet(
        &mut self,
        now: Instant,
        path: &Path,
        data: &[u8],
        ecn: Option<EcnCodepoint>,
    ) -> Result<Vec<Event>, EngineError>;

    /// Assemble at most one packet into `buf`, taking stream payload from `data`.
    ///
    /// `stream_id` of `None` runs the non-stream pass (handshake, ACKs, and any
    /// partially-built coalesced packet). `fin` marks the end of the stream; only set
    /// once all prior stream bytes have been handed to the engine.
    fn writev_stream(
        &mut self,
        now: Instant,
        path: &Path,
        buf: &mut [u8],
        stream_id: Option<i64>,
        data: &[&[u8]],
        fin: bool,
    ) -> Result<WriteOutcome, EngineError>;

    /// Emit a queued unreliable datagram into `buf`, if the engine supports them.
    fn write_datagram(
        &mut self,
        now: Instant,
        path: &Path,
        buf: &mut [u8],
        data: &[u8],
    ) -> Result<WriteOutcome, EngineError>;

    /// ECN codepoint to mark the most recently assembled packet with.
    fn last_ecn(&self) -> Option<EcnCodepoint> {
        None
    }

    /// Tell the engine when the packets it assembled actually hit the wire, so pacing
    /// and loss detection stay sane even across blocked sends.
    fn update_tx_time(&mut self, now: Instant);

    /// Next ACK/loss/PTO/idle deadline, or `None` when no timer is armed.
    fn expiry(&self) -> Option<Instant>;

    /// The deadline passed; run retransmission/idle processing.
    fn handle_expiry(&mut self, now: Instant) -> Result<Vec<Event>, EngineError>;

    /// Current per-packet UDP payload budget for this path.
    fn max_udp_payload_size(&self) -> usize;

    /// Bytes the congestion controller allows in one burst.
    fn send_quantum(&self) -> usize;

    /// Allocate a locally-initiated bidirectional stream id.
    fn open_bidi_stream(&mut self) -> Result<i64, EngineError>;

    /// How many more bidirectional streams we may open right now.
    fn streams_bidi_left(&self) -> u64;

    /// Abruptly terminate one stream with an application error code.
    fn shutdown_stream(&mut self, id: i64, app_code: u64);

    /// Return stream-level flow control credit after the application consumed `n` bytes.
    fn extend_max_stream_data(&mut self, id: i64, n: u64);

    /// Build a CONNECTION_CLOSE packet into `buf`; the connection moves to draining.
    fn close(
        &mut self,
        now: Instant,
        path: &Path,
        buf: &mut [u8],
        code: u64,
        reason: &[u8],
    ) -> Result<usize, EngineError>;

    /// The engine's current probe timeout estimate, used to size the draining linger.
    fn pto(&self) -> Duration;
}

/// Constructor for [`ProtocolEngine`] instances; the Rust analog of linking the
/// process against a particular ngtcp2 build.
pub trait EngineFactory: Send + Sync {
    /// Construct the engine for one connection. For inbound connections the endpoint
    /// has already validated the Initial's version and CIDs.
    fn new_connection(
        &self,
        params: ConnectionParams,
        hooks: EngineHooks,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError>;
}
