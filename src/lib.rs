//! Event-loop driven QUIC transport.
//!
//! [QUIC](https://en.wikipedia.org/wiki/QUIC) is a modern transport protocol addressing
//! shortcomings of TCP, such as head-of-line blocking, poor security, slow handshakes, and
//! inefficient congestion control. This crate provides the event-loop core of a QUIC
//! endpoint: a single UDP socket multiplexing many connections, TLS 1.3 terminated inside
//! QUIC, and reliable bidirectional byte streams plus unreliable datagrams surfaced to the
//! application through callbacks.
//!
//! The entry point is [`Network`], which owns the one thread on which every connection,
//! stream, and endpoint mutation happens. From it you obtain an [`Endpoint`] bound to a
//! local address; an endpoint can [`listen`](Endpoint::listen) for inbound connections,
//! [`connect`](Endpoint::connect) outbound, or both at once.
//!
//! The QUIC protocol state machine itself is an external collaborator: the crate drives
//! any engine implementing [`engine::ProtocolEngine`] (the contract is modeled on ngtcp2's
//! connection API), and any TLS 1.3 provider implementing [`tls::TlsCreds`]. Packet
//! assembly, timers, flow-controlled stream buffering, connection demultiplexing, and the
//! cross-thread job queue are what live here.
//!
//! Stream data is delivered reliably and in order within a stream; there is no ordering
//! between different streams or different connections. All user callbacks run on the loop
//! thread and never concurrently with another callback on the same stream.

#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod builders;
mod connection;
mod endpoint;
mod network;
mod packet;
mod stream;
mod types;
mod udp;

pub mod engine;
pub mod error;
pub mod tls;

pub use crate::builders::{ConnectOptions, ListenOptions};
pub use crate::connection::{Connection, DatagramCb};
pub use crate::endpoint::Endpoint;
pub use crate::error::{CallError, ConfigError, ConnectError, StreamError};
pub use crate::network::Network;
pub use crate::stream::{ChunkProducer, ChunksDoneCb, Stream, StreamCloseCb, StreamDataCb};
pub use crate::types::{Address, ConnectionId, Direction, EcnCodepoint, Packet, Path};

/// Default QUIC datagram payload size used before the path is validated.
pub const DATAGRAM_SIZE: usize = 1200;

/// Largest UDP payload we will emit on a validated path (both address families).
pub const MAX_UDP_PAYLOAD_SIZE: usize = 1452;

/// Per-stream send buffer capacity; also the per-stream flow control window we advertise.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Outstanding-unacked threshold above which upstream producers should pause.
pub const PAUSE_SIZE: usize = 64 * 1024;

/// The only QUIC version this endpoint speaks (RFC 9000).
pub const SUPPORTED_VERSION: u32 = 0x0000_0001;

/// First bytes of application data on the setup stream. The trailing byte is a
/// format revision so future handshakes can break or translate compatibly.
pub const HANDSHAKE_MAGIC: [u8; 8] = [b'l', b'o', b'k', b'i', b'n', b'e', b't', 0x01];

/// Capacity of the cross-thread job queue feeding the event loop.
pub(crate) const JOB_QUEUE_CAPACITY: usize = 1024;

/// How many datagrams a connection packs into one batched send.
pub(crate) const DATAGRAM_BATCH_SIZE: usize = 24;

/// Maximum number of recv/send calls to make before yielding back to the loop
///
/// This helps ensure we don't starve anything when the CPU is slower than the link. Value
/// selected more or less arbitrarily.
pub(crate) const IO_LOOP_BOUND: usize = 10;
