//! Contract with the TLS 1.3 provider.
//!
//! QUIC replaces the TLS record layer but keeps its handshake: the provider runs the
//! handshake state machine and derives packet protection keys, while the engine moves the
//! CRYPTO frames. The traits here are the session surface the engine drives; they mirror
//! the hook set a provider must expose for ngtcp2-style integration (handshake message
//! exchange, AEAD seal/open, header protection masks, key update, context teardown).
//!
//! Certificate loading and trust policy live entirely in the provider; this crate only
//! moves opaque session objects around.

use thiserror::Error;

use crate::types::Direction;

/// A TLS provider failure surfaced during configuration or the handshake.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The credentials could not be loaded or were rejected.
    #[error("bad TLS credentials: {0}")]
    BadCredentials(String),
    /// A handshake message was malformed or unacceptable.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    /// AEAD open failed (packet corrupt or keys out of sync).
    #[error("packet protection failure")]
    Protection,
}

/// QUIC encryption levels, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Initial secrets derived from the client's destination CID.
    Initial,
    /// Handshake keys.
    Handshake,
    /// 1-RTT application keys.
    OneRtt,
}

/// One side's TLS 1.3 session, bound to exactly one engine.
///
/// All methods are driven by the engine from the loop thread. The session carries any
/// provider-native handle internally; the crate never inspects it.
pub trait TlsSession: Send {
    /// Produce the first CRYPTO flight (ClientHello). Outbound sessions only.
    fn client_initial(&mut self) -> Result<Vec<u8>, TlsError>;

    /// Install Initial secrets from the client's original destination CID. Inbound only.
    fn recv_client_initial(&mut self, odcid: &[u8]) -> Result<(), TlsError>;

    /// Feed received CRYPTO data at `level`; returns flights to send back, tagged with
    /// the level they must be carried at.
    fn recv_crypto_data(
        &mut self,
        level: Level,
        data: &[u8],
    ) -> Result<Vec<(Level, Vec<u8>)>, TlsError>;

    /// The server asked us to retry with a token; rebuild Initial keys. Outbound only.
    fn recv_retry(&mut self, new_odcid: &[u8]) -> Result<(), TlsError>;

    /// AEAD-seal `payload` in place (ciphertext plus tag appended), returning its length.
    fn encrypt(
        &mut self,
        level: Level,
        packet_number: u64,
        header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<usize, TlsError>;

    /// AEAD-open `payload` in place, returning the plaintext length.
    fn decrypt(
        &mut self,
        level: Level,
        packet_number: u64,
        header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<usize, TlsError>;

    /// Derive the 5-byte header protection mask for a sample.
    fn header_protection_mask(&mut self, level: Level, sample: &[u8]) -> Result<[u8; 5], TlsError>;

    /// Perform a 1-RTT key update, rolling both directions' keys.
    fn update_key(&mut self) -> Result<(), TlsError>;

    /// Discard keys for a level the handshake has moved past, destroying AEAD contexts.
    fn discard_keys(&mut self, level: Level);

    /// Whether the handshake has completed.
    fn is_complete(&self) -> bool;

    /// The ALPN protocol the peer agreed to, once negotiated.
    fn selected_alpn(&self) -> Option<&[u8]>;
}

/// Shared, immutable TLS credentials plus the provider's session constructor.
///
/// One `TlsCreds` is typically shared by every connection of an endpoint direction.
pub trait TlsCreds: Send + Sync {
    /// Create a session for one connection, offering (outbound) or accepting (inbound)
    /// the given ALPN protocols.
    fn new_session(
        &self,
        direction: Direction,
        alpn: &[Vec<u8>],
    ) -> Result<Box<dyn TlsSession>, TlsError>;
}
