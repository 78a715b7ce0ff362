//! Option builders for [`Endpoint::listen`](crate::Endpoint::listen) and
//! [`Endpoint::connect`](crate::Endpoint::connect), and the shared per-direction
//! context they produce.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::{Connection, DatagramCb};
use crate::engine::EngineFactory;
use crate::stream::{Stream, StreamCloseCb, StreamDataCb};
use crate::tls::TlsCreds;
use crate::types::Direction;

/// Immutable per-direction configuration shared by every connection the endpoint
/// creates in that direction: TLS credentials, the engine binding, ALPN, and the
/// default stream callbacks.
pub(crate) struct IoContext {
    pub(crate) direction: Direction,
    pub(crate) tls: Arc<dyn TlsCreds>,
    pub(crate) engine: Arc<dyn EngineFactory>,
    pub(crate) alpn: Vec<Vec<u8>>,
    pub(crate) stream_data: Option<StreamDataCb>,
    pub(crate) stream_close: Option<StreamCloseCb>,
    pub(crate) dgram: Option<DatagramCb>,
}

/// Options accepted by [`Endpoint::listen`](crate::Endpoint::listen).
pub struct ListenOptions {
    tls: Arc<dyn TlsCreds>,
    engine: Arc<dyn EngineFactory>,
    alpn: Vec<Vec<u8>>,
    stream_data: Option<StreamDataCb>,
    stream_close: Option<StreamCloseCb>,
    dgram: Option<DatagramCb>,
}

impl ListenOptions {
    /// Inbound context from TLS credentials and a protocol engine binding.
    pub fn new(tls: Arc<dyn TlsCreds>, engine: Arc<dyn EngineFactory>) -> Self {
        Self {
            tls,
            engine,
            alpn: Vec::new(),
            stream_data: None,
            stream_close: None,
            dgram: None,
        }
    }

    /// Add an ALPN protocol this endpoint accepts.
    pub fn alpn(mut self, proto: impl Into<Vec<u8>>) -> Self {
        self.alpn.push(proto.into());
        self
    }

    /// Default data callback for streams the peers open.
    pub fn on_stream_data(mut self, cb: impl Fn(&Stream, Bytes) + Send + Sync + 'static) -> Self {
        self.stream_data = Some(Arc::new(cb));
        self
    }

    /// Default close callback for streams the peers open.
    pub fn on_stream_close(mut self, cb: impl Fn(&Stream, u64) + Send + Sync + 'static) -> Self {
        self.stream_close = Some(Arc::new(cb));
        self
    }

    /// Callback for unreliable datagrams arriving on inbound connections.
    pub fn on_datagram(mut self, cb: impl Fn(&Connection, Bytes) + Send + Sync + 'static) -> Self {
        self.dgram = Some(Arc::new(cb));
        self
    }

    pub(crate) fn into_context(self) -> IoContext {
        IoContext {
            direction: Direction::Inbound,
            tls: self.tls,
            engine: self.engine,
            alpn: self.alpn,
            stream_data: self.stream_data,
            stream_close: self.stream_close,
            dgram: self.dgram,
        }
    }
}

/// Options accepted by [`Endpoint::connect`](crate::Endpoint::connect).
pub struct ConnectOptions {
    tls: Arc<dyn TlsCreds>,
    engine: Arc<dyn EngineFactory>,
    alpn: Vec<Vec<u8>>,
    stream_data: Option<StreamDataCb>,
    stream_close: Option<StreamCloseCb>,
    dgram: Option<DatagramCb>,
}

impl ConnectOptions {
    /// Outbound context from TLS credentials and a protocol engine binding.
    pub fn new(tls: Arc<dyn TlsCreds>, engine: Arc<dyn EngineFactory>) -> Self {
        Self {
            tls,
            engine,
            alpn: Vec::new(),
            stream_data: None,
            stream_close: None,
            dgram: None,
        }
    }

    /// Add an ALPN protocol to offer.
    pub fn alpn(mut self, proto: impl Into<Vec<u8>>) -> Self {
        self.alpn.push(proto.into());
        self
    }

    /// Default data callback for streams on this connection.
    pub fn on_stream_data(mut self, cb: impl Fn(&Stream, Bytes) + Send + Sync + 'static) -> Self {
        self.stream_data = Some(Arc::new(cb));
        self
    }

    /// Default close callback for streams on this connection.
    pub fn on_stream_close(mut self, cb: impl Fn(&Stream, u64) + Send + Sync + 'static) -> Self {
        self.stream_close = Some(Arc::new(cb));
        self
    }

    /// Callback for unreliable datagrams arriving on this connection.
    pub fn on_datagram(mut self, cb: impl Fn(&Connection, Bytes) + Send + Sync + 'static) -> Self {
        self.dgram = Some(Arc::new(cb));
        self
    }

    pub(crate) fn into_context(self) -> IoContext {
        IoContext {
            direction: Direction::Outbound,
            tls: self.tls,
            engine: self.engine,
            alpn: self.alpn,
            stream_data: self.stream_data,
            stream_close: self.stream_close,
            dgram: self.dgram,
        }
    }
}
