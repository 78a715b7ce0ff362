use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::connection::{ConnectionRef, Deferred};
use crate::MAX_BUFFER_SIZE;

/// User callback receiving ordered stream payload. Runs on the loop thread, never
/// concurrently with another callback on the same stream.
pub type StreamDataCb = Arc<dyn Fn(&Stream, Bytes) + Send + Sync>;

/// User callback observing stream close; fired at most once, after which no further
/// callbacks touch the stream.
pub type StreamCloseCb = Arc<dyn Fn(&Stream, u64) + Send + Sync>;

/// Producer polled by [`Stream::send_chunks`]; `None` or an empty chunk ends the run.
pub type ChunkProducer = Box<dyn FnMut(&Stream) -> Option<Bytes> + Send>;

/// Completion hook for [`Stream::send_chunks`]; may itself begin another chunk run.
pub type ChunksDoneCb = Box<dyn FnOnce(&Stream) + Send>;

/// A reliable, ordered, bidirectional QUIC stream (send-side handle).
///
/// Cheap to clone; all handles refer to the same stream. Mutating calls are dispatched
/// onto the owning network's loop thread, so they may be used from any thread and from
/// inside callbacks.
#[derive(Clone)]
pub struct Stream {
    pub(crate) conn: ConnectionRef,
    pub(crate) id: i64,
}

impl Stream {
    /// The engine-assigned stream id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Queue bytes for transmission. Zero-length sends are a no-op; sends on a closing
    /// or shut-down stream are silently discarded (closing is terminal).
    ///
    /// An owned [`Bytes`] is queued zero-copy; borrowed data is copied into the stream's
    /// ring buffer. The caller is expected to respect [`available`](Self::available) —
    /// this library buffers nothing beyond the ring plus the surrendered chunks.
    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let this = self.clone();
        self.conn.net.call(move || {
            let mut state = this.conn.state.lock().unwrap();
            if let Some(stream) = state.streams.get_mut(&this.id) {
                stream.queue_send(data);
            }
            drop(state);
            this.conn.io_ready();
        });
    }

    /// Feed the stream from `producer`, keeping at most `parallel` chunks in flight
    /// (a chunk is in flight until its last byte is acknowledged). Once the producer
    /// yields the end sentinel and every chunk is acknowledged, `on_done` runs on the
    /// loop thread; it may start another generator on the same stream.
    pub fn send_chunks(
        &self,
        producer: impl FnMut(&Stream) -> Option<Bytes> + Send + 'static,
        on_done: impl FnOnce(&Stream) + Send + 'static,
        parallel: usize,
    ) {
        let this = self.clone();
        let producer: ChunkProducer = Box::new(producer);
        let on_done: ChunksDoneCb = Box::new(on_done);
        self.conn.net.call(move || {
            {
                let mut state = this.conn.state.lock().unwrap();
                let Some(stream) = state.streams.get_mut(&this.id) else {
                    return;
                };
                stream.chunks = Some(ChunkSender {
                    producer: Some(producer),
                    on_done: Some(on_done),
                    parallel: parallel.max(1),
                    inflight: VecDeque::new(),
                    exhausted: false,
                });
            }
            crate::connection::run_deferred(&this.conn, vec![Deferred::Refill { id: this.id }]);
            this.conn.io_ready();
        });
    }

    /// Close the stream.
    ///
    /// With no error code the close is graceful: buffered bytes drain to the peer, FIN
    /// is emitted, and the close callback fires exactly once. With an error code the
    /// stream is shut down abruptly at the engine level. Re-closing is a no-op.
    pub fn close(&self, error: Option<u64>) {
        let this = self.clone();
        self.conn.net.call(move || {
            crate::connection::close_stream(&this.conn, this.id, error);
        });
    }

    /// Bytes that may still be queued before the send buffer is full.
    pub fn available(&self) -> usize {
        self.with_state(StreamState::available)
    }

    /// Ring-buffer bytes currently held (sent-but-unacknowledged plus unsent). Never
    /// exceeds the buffer capacity; surrendered chunks are counted by
    /// [`backlog`](Self::backlog) instead.
    pub fn used(&self) -> usize {
        self.with_state(StreamState::used)
    }

    /// Ring-buffer bytes sent and awaiting acknowledgement.
    pub fn unacked(&self) -> usize {
        self.with_state(StreamState::unacked)
    }

    /// Ring-buffer bytes queued but not yet handed to the protocol engine.
    pub fn unsent(&self) -> usize {
        self.with_state(StreamState::unsent)
    }

    /// Bytes waiting in surrendered chunks behind the ring; not bounded by the ring
    /// capacity, so producers should pace on it alongside [`available`](Self::available).
    pub fn backlog(&self) -> usize {
        self.with_state(StreamState::backlog)
    }

    fn with_state(&self, f: impl FnOnce(&StreamState) -> usize) -> usize {
        let state = self.conn.state.lock().unwrap();
        state.streams.get(&self.id).map(f).unwrap_or(0)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

/// Bookkeeping for one [`Stream::send_chunks`] run.
pub(crate) struct ChunkSender {
    /// Taken out while user code runs, so a re-entrant producer can't observe a hole.
    pub(crate) producer: Option<ChunkProducer>,
    pub(crate) on_done: Option<ChunksDoneCb>,
    pub(crate) parallel: usize,
    /// Per-chunk end offsets in the stream's cumulative queued-byte space.
    pub(crate) inflight: VecDeque<u64>,
    pub(crate) exhausted: bool,
}

impl ChunkSender {
    /// Whether another chunk should be requested from the producer right now.
    pub(crate) fn wants_chunk(&self) -> bool {
        !self.exhausted && self.inflight.len() < self.parallel && self.producer.is_some()
    }

    /// Drop completed chunks; returns true if any completed (freeing a parallel slot).
    pub(crate) fn reap(&mut self, acked_total: u64) -> bool {
        let mut reaped = false;
        while self
            .inflight
            .front()
            .is_some_and(|&end| end <= acked_total)
        {
            self.inflight.pop_front();
            reaped = true;
        }
        reaped
    }

    pub(crate) fn is_done(&self) -> bool {
        self.exhausted && self.inflight.is_empty()
    }
}

/// Send-side state of one stream. Lives inside the owning connection's state and is only
/// touched with that lock held, on the loop thread.
///
/// `size`, `start`, and `unacked_size` are offsets into the ring only; the surrendered
/// chunks in `user_buffers` form a disjoint queue behind it with its own counters, so
/// `unacked_size <= size <= buf.len()` holds at every point.
pub(crate) struct StreamState {
    pub(crate) id: i64,
    /// Fixed-capacity ring holding copied sends.
    buf: Box<[u8]>,
    /// Ring read offset: the oldest held (sent-but-unacked) byte.
    start: usize,
    /// Bytes currently stored in the ring.
    size: usize,
    /// Ring bytes already handed to the engine and awaiting acknowledgement.
    unacked_size: usize,
    /// Caller-owned chunks queued zero-copy behind the ring.
    user_buffers: VecDeque<Bytes>,
    /// Bytes currently held in `user_buffers`.
    ub_size: usize,
    /// `user_buffers` bytes handed to the engine and awaiting acknowledgement.
    ub_unacked: usize,
    /// Cumulative bytes ever queued / ever acknowledged, for chunk bookkeeping.
    pub(crate) tx_queued: u64,
    pub(crate) acked_total: u64,

    pub(crate) is_new: bool,
    pub(crate) is_closing: bool,
    pub(crate) is_shutdown: bool,
    pub(crate) sent_fin: bool,
    /// Code to hand the close callback when FIN goes out.
    pub(crate) close_code: u64,
    pub(crate) close_fired: bool,

    pub(crate) data_cb: Option<StreamDataCb>,
    pub(crate) close_cb: Option<StreamCloseCb>,
    pub(crate) chunks: Option<ChunkSender>,
}

impl StreamState {
    pub(crate) fn new(
        id: i64,
        capacity: usize,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Self {
        Self {
            id,
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            size: 0,
            unacked_size: 0,
            user_buffers: VecDeque::new(),
            ub_size: 0,
            ub_unacked: 0,
            tx_queued: 0,
            acked_total: 0,
            is_new: true,
            is_closing: false,
            is_shutdown: false,
            sent_fin: false,
            close_code: 0,
            close_fired: false,
            data_cb,
            close_cb,
            chunks: None,
        }
    }

    pub(crate) fn with_default_capacity(
        id: i64,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Self {
        Self::new(id, MAX_BUFFER_SIZE, data_cb, close_cb)
    }

    /// Append to the send queue, copying into the ring when that preserves order.
    pub(crate) fn queue_send(&mut self, data: Bytes) {
        if self.is_shutdown || self.is_closing {
            trace!(stream = self.id, "dropping send on closed stream");
            return;
        }
        let len = data.len();
        if self.user_buffers.is_empty() && len <= self.buf.len() - self.size {
            self.copy_into_ring(&data);
        } else {
            // Ordering: once anything sits in the user queue, later sends must queue
            // behind it rather than jump ahead via the ring.
            self.user_buffers.push_back(data);
            self.ub_size += len;
        }
        self.tx_queued += len as u64;
    }

    fn copy_into_ring(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let mut copied = 0;
        while copied < data.len() {
            let pos = (self.start + self.size) % cap;
            let n = (cap - pos).min(data.len() - copied);
            self.buf[pos..pos + n].copy_from_slice(&data[copied..copied + n]);
            self.size += n;
            copied += n;
        }
    }

    /// Views of the unsent suffix, in order: ring remainder first (at most two slices
    /// around the wrap), then queued user buffers.
    pub(crate) fn pending(&self) -> Vec<&[u8]> {
        let mut out = Vec::new();

        let unsent_ring = self.size - self.unacked_size;
        if unsent_ring > 0 {
            let cap = self.buf.len();
            let begin = (self.start + self.unacked_size) % cap;
            let first = unsent_ring.min(cap - begin);
            out.push(&self.buf[begin..begin + first]);
            if unsent_ring > first {
                out.push(&self.buf[..unsent_ring - first]);
            }
        }

        let mut skip = self.ub_unacked;
        for b in &self.user_buffers {
            if skip >= b.len() {
                skip -= b.len();
                continue;
            }
            out.push(&b[skip..]);
            skip = 0;
        }
        out
    }

    /// The engine packetized `bytes` more stream bytes; they now await acknowledgement.
    /// Ring bytes always precede user-buffer bytes in the send order.
    pub(crate) fn wrote(&mut self, bytes: usize) {
        let from_ring = bytes.min(self.size - self.unacked_size);
        self.unacked_size += from_ring;
        let rest = bytes - from_ring;
        debug_assert!(self.ub_unacked + rest <= self.ub_size);
        self.ub_unacked += rest;
    }

    /// The peer acknowledged `bytes` from the front of the held region; retire them and
    /// grow `available()`.
    pub(crate) fn acknowledge(&mut self, bytes: usize) {
        let bytes = bytes.min(self.unacked_size + self.ub_unacked);
        let cap = self.buf.len();

        let from_ring = bytes.min(self.unacked_size);
        self.start = (self.start + from_ring) % cap;
        self.size -= from_ring;
        self.unacked_size -= from_ring;

        let mut rest = bytes - from_ring;
        self.ub_size -= rest;
        self.ub_unacked -= rest;
        while rest > 0 {
            let front = self
                .user_buffers
                .front_mut()
                .expect("acked bytes must be held");
            if front.len() <= rest {
                rest -= front.len();
                self.user_buffers.pop_front();
            } else {
                front.advance(rest);
                rest = 0;
            }
        }

        self.acked_total += bytes as u64;
    }

    pub(crate) fn available(&self) -> usize {
        if self.is_closing || self.buf.is_empty() {
            0
        } else {
            self.buf.len() - self.size
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.size
    }

    pub(crate) fn unacked(&self) -> usize {
        self.unacked_size
    }

    pub(crate) fn unsent(&self) -> usize {
        self.used() - self.unacked()
    }

    /// Bytes held in surrendered chunks beyond the ring.
    pub(crate) fn backlog(&self) -> usize {
        self.ub_size
    }

    /// Unsent bytes across the ring and the user-buffer queue; gates FIN emission.
    pub(crate) fn unsent_total(&self) -> usize {
        (self.size - self.unacked_size) + (self.ub_size - self.ub_unacked)
    }
}
