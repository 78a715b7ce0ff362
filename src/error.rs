//! Error taxonomy and the application-visible close codes.

use std::io;

use thiserror::Error;

/// Close code when the initial connection handshake fails.
pub const ERROR_CONNECT: u64 = 0x5471907;
/// Close code for an invalid first stream payload.
pub const ERROR_BAD_INIT: u64 = 0x5471908;
/// Close code for an upstream TCP-side failure when tunneling.
pub const ERROR_TCP: u64 = 0x5471909;

/// Stream close code when a user callback panicked.
pub const STREAM_ERROR_EXCEPTION: u64 = (1u64 << 62) - 2;
/// Stream close code when the stream outlived its connection.
pub const STREAM_ERROR_CONNECTION_EXPIRED: u64 = (1u64 << 62) + 1;

/// Failure submitting or running a cross-thread job.
#[derive(Debug, Error)]
pub enum CallError {
    /// The network was closed before the job could run.
    #[error("network closed")]
    Closed,
    /// The job queue is at capacity; the loop thread is not keeping up.
    #[error("job queue full")]
    QueueFull,
    /// The job panicked on the loop thread; the panic payload's message, if any.
    #[error("job panicked: {0}")]
    JobPanicked(String),
}

/// Synchronous configuration failure from `Network::endpoint`, `listen`, or `connect`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Binding the UDP socket failed.
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[from] io::Error),
    /// The TLS provider rejected the supplied credentials.
    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] crate::tls::TlsError),
    /// The network is shut down.
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Failure establishing an outbound connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Context construction failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The protocol engine refused to construct the connection.
    #[error("engine initialization failed: {0}")]
    Engine(#[from] crate::engine::EngineError),
    /// The endpoint is not able to reach out (e.g. no outbound context).
    #[error("endpoint cannot initiate connections")]
    NotOutbound,
}

/// Failure on the stream surface.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The peer's bidirectional stream budget is exhausted; retry after
    /// the peer raises `max_streams`.
    #[error("no bidirectional streams available on this connection")]
    StreamsExhausted,
    /// The stream is already shut down.
    #[error("stream is shut down")]
    Shutdown,
    /// The owning connection is closed or draining.
    #[error("connection lost")]
    ConnectionLost,
}
