use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::builders::IoContext;
use crate::endpoint::EndpointInner;
use crate::engine::{ConnectionParams, EngineHooks, Event, ProtocolEngine, WriteOutcome};
use crate::error::{ConnectError, STREAM_ERROR_CONNECTION_EXPIRED, STREAM_ERROR_EXCEPTION};
use crate::network::NetHandle;
use crate::stream::{ChunksDoneCb, Stream, StreamCloseCb, StreamDataCb, StreamState};
use crate::types::{ConnectionId, Direction, Packet, Path};
use crate::udp::{PacketBatch, SendStatus, UdpSocket};
use crate::{DATAGRAM_SIZE, SUPPORTED_VERSION};

/// User callback receiving unreliable datagrams. Loop-thread invocation.
pub type DatagramCb = Arc<dyn Fn(&Connection, Bytes) + Send + Sync>;

/// Handle to one QUIC connection.
///
/// Cheap to clone. The connection stays alive while its endpoint holds it; handles
/// outliving the connection observe failed operations rather than dangling state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: ConnectionRef,
}

impl Connection {
    /// Open a locally-initiated bidirectional stream using the context's default
    /// callbacks.
    pub fn get_new_stream(&self) -> Result<Stream, crate::StreamError> {
        self.get_new_stream_with(None, None)
    }

    /// Open a locally-initiated bidirectional stream with per-stream callbacks
    /// (falling back to the context defaults where `None`).
    pub fn get_new_stream_with(
        &self,
        data_cb: Option<StreamDataCb>,
        close_cb: Option<StreamCloseCb>,
    ) -> Result<Stream, crate::StreamError> {
        let conn = self.inner.clone();
        self.inner
            .net
            .call_get(move || open_stream(&conn, data_cb, close_cb))
            .map_err(|_| crate::StreamError::ConnectionLost)?
    }

    /// Our connection ID: what the peer puts in the destination field.
    pub fn scid(&self) -> ConnectionId {
        self.inner.source_cid
    }

    /// Whether we initiated this connection.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Whether the TLS handshake has completed and application data may flow.
    pub fn is_established(&self) -> bool {
        self.inner.state.lock().unwrap().handshake_done
    }

    /// The peer's address.
    pub fn remote(&self) -> crate::Address {
        self.inner.state.lock().unwrap().path.remote
    }

    /// Queue one unreliable datagram. Dropped silently if the connection is closing.
    pub fn send_datagram(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let conn = self.inner.clone();
        self.inner.net.call(move || {
            {
                let mut state = conn.state.lock().unwrap();
                if state.status != Status::Open {
                    return;
                }
                state.dgram_queue.push_back(data);
            }
            conn.io_ready();
        });
    }

    /// Close the connection: emit CONNECTION_CLOSE and move to draining. Streams fire
    /// their close callbacks with [`STREAM_ERROR_CONNECTION_EXPIRED`].
    pub fn close(&self, code: u64, reason: &str) {
        let conn = self.inner.clone();
        let reason = reason.to_owned();
        self.inner.net.call(move || {
            close_connection(&conn, code, &reason);
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("scid", &self.inner.source_cid)
            .field("direction", &self.inner.direction)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    /// CONNECTION_CLOSE seen or sent; absorbing packets until the linger deadline.
    Draining,
    /// Removed from the endpoint; the driver exits on sight.
    Dead,
}

pub(crate) struct ConnectionInner {
    pub(crate) state: Mutex<State>,
    /// Coalescing wake-up for the driver; armed by anything that queued work.
    io_trigger: Notify,
    driver_exit: Notify,
    pub(crate) net: NetHandle,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) endpoint: Weak<EndpointInner>,
    pub(crate) source_cid: ConnectionId,
    pub(crate) direction: Direction,
}

/// Shared reference to a connection's state; the owning reference lives in the
/// endpoint's connection map.
pub(crate) struct ConnectionRef(Arc<ConnectionInner>);

impl ConnectionRef {
    pub(crate) fn io_ready(&self) {
        self.0.io_trigger.notify_one();
    }

    /// Mark dead and wake the driver so it exits. Called by the endpoint when the
    /// draining deadline passes or the endpoint itself shuts down.
    pub(crate) fn retire(&self) {
        self.0.state.lock().unwrap().status = Status::Dead;
        self.0.driver_exit.notify_one();
        self.0.io_trigger.notify_one();
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.0.state.lock().unwrap().status != Status::Open
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Deref for ConnectionRef {
    type Target = ConnectionInner;
    fn deref(&self) -> &ConnectionInner {
        &self.0
    }
}

pub(crate) struct State {
    pub(crate) engine: Box<dyn ProtocolEngine>,
    pub(crate) path: Path,
    pub(crate) dest_cid: ConnectionId,
    pub(crate) streams: BTreeMap<i64, StreamState>,
    pub(crate) status: Status,
    batch: PacketBatch,
    dgram_queue: VecDeque<Bytes>,
    timer_deadline: Option<Instant>,
    handshake_done: bool,
    ctx: Arc<IoContext>,
    /// Ingress classification tag for the packets we emit.
    pkt_tag: u8,
}

/// Work that must run after the state lock is released: user callbacks and
/// endpoint-side bookkeeping. Never touch user code with a lock held.
pub(crate) enum Deferred {
    Data {
        id: i64,
        cb: StreamDataCb,
        data: Bytes,
    },
    CloseCb {
        id: i64,
        cb: StreamCloseCb,
        code: u64,
    },
    Refill {
        id: i64,
    },
    ChunksDone {
        id: i64,
        f: ChunksDoneCb,
    },
    Datagram {
        cb: DatagramCb,
        data: Bytes,
    },
    StartDrain {
        deadline: Instant,
    },
    NoteBlocked,
}

/// Construct a connection (either direction), bind its TLS session, and spawn its
/// driver on the loop. Must run on the loop thread.
pub(crate) fn new_connection(
    net: NetHandle,
    socket: Arc<UdpSocket>,
    endpoint: Weak<EndpointInner>,
    ctx: Arc<IoContext>,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    path: Path,
) -> Result<ConnectionRef, ConnectError> {
    let direction = ctx.direction;
    let hooks = EngineHooks {
        rand: Box::new(|dest| rand::thread_rng().fill_bytes(dest)),
        new_connection_id: Box::new(|len| {
            let mut token = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut token);
            (ConnectionId::random(len), token)
        }),
        path_challenge: Box::new(|dest| rand::thread_rng().fill_bytes(dest)),
    };
    let params = ConnectionParams {
        direction,
        local_cid,
        remote_cid,
        path,
        alpn: ctx.alpn.clone(),
        version: SUPPORTED_VERSION,
    };
    let mut engine = ctx.engine.new_connection(params, hooks)?;
    let session = ctx
        .tls
        .new_session(direction, &ctx.alpn)
        .map_err(crate::ConfigError::Tls)?;
    engine.bind_tls(session);

    let conn = ConnectionRef(Arc::new(ConnectionInner {
        state: Mutex::new(State {
            engine,
            path,
            dest_cid: remote_cid,
            streams: BTreeMap::new(),
            status: Status::Open,
            batch: PacketBatch::new(),
            dgram_queue: VecDeque::new(),
            timer_deadline: None,
            handshake_done: false,
            pkt_tag: direction.packet_tag(),
            ctx,
        }),
        io_trigger: Notify::new(),
        driver_exit: Notify::new(),
        net,
        socket,
        endpoint,
        source_cid: local_cid,
        direction,
    }));

    debug!(scid = %local_cid, %direction, %path, "connection created");
    tokio::spawn(drive(conn.clone()));
    // Kick the first flight (client Initial, or the server's handshake response once
    // the Initial has been fed in).
    conn.io_ready();
    Ok(conn)
}

/// The per-connection driver task: waits for io-ready wake-ups, the retransmit timer,
/// or retirement, and runs the packet-write loop.
async fn drive(conn: ConnectionRef) {
    loop {
        let deadline = {
            let state = conn.state.lock().unwrap();
            if state.status == Status::Dead {
                break;
            }
            state.timer_deadline
        };

        let expired = tokio::select! {
            _ = conn.io_trigger.notified() => false,
            _ = sleep_or_never(deadline) => true,
            _ = conn.driver_exit.notified() => break,
        };

        let mut actions = Vec::new();
        if expired {
            on_expiry(&conn, &mut actions);
        }
        flush_streams(&conn, &mut actions);
        run_deferred(&conn, actions);
    }
    trace!(scid = %conn.source_cid, "connection driver finished");
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d.into()).await,
        None => std::future::pending().await,
    }
}

/// Retransmit timer fired: hand the engine the current timestamp and apply whatever
/// ACK/loss work it reports. The follow-up `flush_streams` carries the retransmissions.
fn on_expiry(conn: &ConnectionRef, actions: &mut Vec<Deferred>) {
    let mut state = conn.state.lock().unwrap();
    if state.status != Status::Open {
        return;
    }
    state.timer_deadline = None;
    let now = Instant::now();
    match state.engine.handle_expiry(now) {
        Ok(events) => {
            let mut deferred = apply_events(&mut state, conn, events);
            actions.append(&mut deferred);
        }
        Err(e) => {
            warn!(scid = %conn.source_cid, "expiry handler failed: {e}");
            let mut deferred = close_locked(&mut state, conn, e.close_code, &e.reason);
            actions.append(&mut deferred);
        }
    }
}

/// The packet-write loop: datagrams, then stream data, then the non-stream pass for
/// handshake/ACK frames, then timer reprogramming.
fn flush_streams(conn: &ConnectionRef, actions: &mut Vec<Deferred>) {
    let mut state = conn.state.lock().unwrap();
    if state.status != Status::Open {
        return;
    }
    let now = Instant::now();

    // A batch retained by an earlier blocked send goes out first, unchanged, so loss
    // detection keeps seeing the bytes it was told about.
    if !state.batch.is_empty() {
        match flush_batch(&mut state, conn, now) {
            FlushControl::Continue => {}
            FlushControl::Stop => {
                schedule_retransmit(&mut state, now, actions);
                return;
            }
            FlushControl::Fatal(code, reason) => {
                let mut deferred = close_locked(&mut state, conn, code, &reason);
                actions.append(&mut deferred);
                return;
            }
        }
    }

    if let Some(control) = flush_datagrams(&mut state, conn, now) {
        match control {
            FlushControl::Continue => {}
            FlushControl::Stop => {
                schedule_retransmit(&mut state, now, actions);
                return;
            }
            FlushControl::Fatal(code, reason) => {
                let mut deferred = close_locked(&mut state, conn, code, &reason);
                actions.append(&mut deferred);
                return;
            }
        }
    }

    // Maximum number of stream data packets to send out at once; when we hit it we
    // re-arm the io trigger and yield so one busy connection can't starve the loop.
    let max_payload = state.engine.max_udp_payload_size().min(crate::MAX_UDP_PAYLOAD_SIZE);
    let max_stream_packets = (state.engine.send_quantum() / max_payload.max(1)).max(1);
    let mut stream_packets = 0usize;

    let mut work: Vec<i64> = state
        .streams
        .iter()
        .filter(|(_, s)| !s.sent_fin)
        .map(|(id, _)| *id)
        .collect();

    'stream_pass: while !work.is_empty() && stream_packets < max_stream_packets {
        let mut i = 0;
        while i < work.len() {
            let id = work[i];
            let State {
                engine,
                streams,
                batch,
                path,
                ..
            } = &mut *state;
            let Some(stream) = streams.get_mut(&id) else {
                work.remove(i);
                continue;
            };
            stream.is_new = false;
            let fin = stream.is_closing && !stream.sent_fin && stream.unsent_total() == 0;
            let Some(scratch) = batch.scratch() else {
                match flush_batch(&mut state, conn, now) {
                    FlushControl::Continue => continue,
                    FlushControl::Stop => {
                        schedule_retransmit(&mut state, now, actions);
                        return;
                    }
                    FlushControl::Fatal(code, reason) => {
                        let mut deferred = close_locked(&mut state, conn, code, &reason);
                        actions.append(&mut deferred);
                        return;
                    }
                }
            };

            let bufs = stream.pending();
            let outcome = engine.writev_stream(now, path, scratch, Some(id), &bufs, fin);
            drop(bufs);

            match outcome {
                Ok(WriteOutcome::Packet { len, consumed }) => {
                    stream.wrote(consumed);
                    if fin {
                        stream.sent_fin = true;
                        finish_close(stream, actions);
                    }
                    let ecn = engine.last_ecn();
                    batch.commit(len, ecn);
                    stream_packets += 1;
                    let still_busy = {
                        let s = &state.streams[&id];
                        s.unsent_total() > 0 || (s.is_closing && !s.sent_fin)
                    };
                    match flush_batch(&mut state, conn, now) {
                        FlushControl::Continue => {}
                        FlushControl::Stop => {
                            schedule_retransmit(&mut state, now, actions);
                            return;
                        }
                        FlushControl::Fatal(code, reason) => {
                            let mut deferred = close_locked(&mut state, conn, code, &reason);
                            actions.append(&mut deferred);
                            return;
                        }
                    }
                    if !still_busy {
                        work.remove(i);
                    } else {
                        i += 1;
                    }
                    if stream_packets == max_stream_packets {
                        trace!(max_stream_packets, "stream packet budget reached, yielding");
                        state.engine.update_tx_time(now);
                        // Another wake-up continues where we left off.
                        conn.io_ready();
                        schedule_retransmit(&mut state, now, actions);
                        return;
                    }
                }
                Ok(WriteOutcome::WriteMore { consumed }) => {
                    // Engine absorbed the frame and wants more coalesced data; move on
                    // to the next stream with the packet still open.
                    stream.wrote(consumed);
                    if fin {
                        stream.sent_fin = true;
                        finish_close(stream, actions);
                    }
                    work.remove(i);
                }
                Ok(WriteOutcome::Congested) => {
                    trace!(stream = id, "congested, deferring stream data");
                    engine.update_tx_time(now);
                    work.clear();
                    break 'stream_pass;
                }
                Ok(WriteOutcome::StreamDataBlocked) => {
                    trace!(stream = id, "stream flow-control blocked");
                    work.remove(i);
                }
                Ok(WriteOutcome::StreamShutdown) | Ok(WriteOutcome::Closing) => {
                    work.remove(i);
                }
                Err(e) => {
                    warn!(stream = id, "fatal stream write error: {e}");
                    let mut deferred = close_locked(&mut state, conn, e.close_code, &e.reason);
                    actions.append(&mut deferred);
                    return;
                }
            }
        }
    }

    // Now try more with no stream: this takes care of things like handshake packets
    // and ACKs, and also finishes off any partially-filled packet from above.
    loop {
        let State {
            engine,
            batch,
            path,
            ..
        } = &mut *state;
        let Some(scratch) = batch.scratch() else {
            match flush_batch(&mut state, conn, now) {
                FlushControl::Continue => continue,
                FlushControl::Stop => {
                    schedule_retransmit(&mut state, now, actions);
                    return;
                }
                FlushControl::Fatal(code, reason) => {
                    let mut deferred = close_locked(&mut state, conn, code, &reason);
                    actions.append(&mut deferred);
                    return;
                }
            }
        };
        match engine.writev_stream(now, path, scratch, None, &[], false) {
            Ok(WriteOutcome::Packet { len, .. }) => {
                let ecn = engine.last_ecn();
                batch.commit(len, ecn);
                match flush_batch(&mut state, conn, now) {
                    FlushControl::Continue => {}
                    FlushControl::Stop => {
                        schedule_retransmit(&mut state, now, actions);
                        return;
                    }
                    FlushControl::Fatal(code, reason) => {
                        let mut deferred = close_locked(&mut state, conn, code, &reason);
                        actions.append(&mut deferred);
                        return;
                    }
                }
            }
            Ok(WriteOutcome::WriteMore { .. }) => continue,
            Ok(_) => break,
            Err(e) => {
                warn!("fatal non-stream write error: {e}");
                let mut deferred = close_locked(&mut state, conn, e.close_code, &e.reason);
                actions.append(&mut deferred);
                return;
            }
        }
    }

    schedule_retransmit(&mut state, now, actions);
}

enum FlushControl {
    Continue,
    /// Socket blocked: batch retained, timer re-armed, yield until writable/expiry.
    Stop,
    Fatal(u64, String),
}

fn flush_batch(state: &mut State, conn: &ConnectionRef, now: Instant) -> FlushControl {
    if state.batch.is_empty() {
        return FlushControl::Continue;
    }
    let remote = state.path.remote;
    match conn.socket.send_batch(remote, &mut state.batch) {
        SendStatus::Sent => {
            state.engine.update_tx_time(now);
            FlushControl::Continue
        }
        SendStatus::Blocked => {
            debug!(scid = %conn.source_cid, tag = state.pkt_tag, "send blocked, retaining batch");
            state.engine.update_tx_time(now);
            FlushControl::Stop
        }
        SendStatus::Fatal(e) => {
            FlushControl::Fatal(crate::error::ERROR_TCP, format!("socket failure: {e}"))
        }
    }
}

fn flush_datagrams(state: &mut State, conn: &ConnectionRef, now: Instant) -> Option<FlushControl> {
    while !state.dgram_queue.is_empty() {
        let State {
            engine,
            batch,
            path,
            dgram_queue,
            ..
        } = &mut *state;
        let Some(scratch) = batch.scratch() else {
            match flush_batch(state, conn, now) {
                FlushControl::Continue => continue,
                other => return Some(other),
            }
        };
        let front = dgram_queue.front().expect("checked non-empty");
        match engine.write_datagram(now, path, scratch, front) {
            Ok(WriteOutcome::Packet { len, .. }) => {
                dgram_queue.pop_front();
                let ecn = engine.last_ecn();
                batch.commit(len, ecn);
                match flush_batch(state, conn, now) {
                    FlushControl::Continue => {}
                    other => return Some(other),
                }
            }
            Ok(WriteOutcome::WriteMore { .. }) => {
                dgram_queue.pop_front();
            }
            // Leave queued datagrams for a later flush; the stream and handshake
            // passes still get their turn.
            Ok(_) => break,
            Err(e) => return Some(FlushControl::Fatal(e.close_code, e.reason)),
        }
    }
    None
}

/// Read the engine's next expiry and program the retransmit timer; "never" cancels it.
fn schedule_retransmit(state: &mut State, now: Instant, actions: &mut Vec<Deferred>) {
    if !state.batch.is_empty() {
        // Blocked batch: ask the endpoint for a writability kick as well.
        actions.push(Deferred::NoteBlocked);
    }
    let expiry = state.engine.expiry();
    state.timer_deadline = expiry.map(|e| e.max(now));
    trace!(?expiry, "retransmit timer scheduled");
}

/// FIN just went out: fire the close callback exactly once.
fn finish_close(stream: &mut StreamState, actions: &mut Vec<Deferred>) {
    if stream.close_fired {
        return;
    }
    stream.close_fired = true;
    if let Some(cb) = stream.close_cb.clone() {
        actions.push(Deferred::CloseCb {
            id: stream.id,
            cb,
            code: stream.close_code,
        });
    }
}

/// Feed one received datagram to the engine. Draining connections absorb silently.
pub(crate) fn read_packet(conn: &ConnectionRef, pkt: &Packet) {
    let actions = {
        let mut state = conn.state.lock().unwrap();
        if state.status != Status::Open {
            trace!(scid = %conn.source_cid, "absorbing packet on draining connection");
            return;
        }
        if conn.direction == Direction::Inbound && pkt.path.remote != state.path.remote {
            debug!(scid = %conn.source_cid, from = %pkt.path.remote, "peer source address updated");
            state.path.remote = pkt.path.remote;
        }
        let now = Instant::now();
        let result = {
            let State { engine, path, .. } = &mut *state;
            engine.read_packet(now, path, &pkt.data, pkt.ecn)
        };
        match result {
            Ok(events) => apply_events(&mut state, conn, events),
            Err(e) => {
                warn!(scid = %conn.source_cid, "engine rejected packet: {e}");
                close_locked(&mut state, conn, e.close_code, &e.reason)
            }
        }
    };
    run_deferred(conn, actions);
    conn.io_ready();
}

fn apply_events(state: &mut State, conn: &ConnectionRef, events: Vec<Event>) -> Vec<Deferred> {
    let mut actions = Vec::new();
    for event in events {
        match event {
            Event::HandshakeCompleted => {
                debug!(scid = %conn.source_cid, "handshake completed");
                state.handshake_done = true;
            }
            Event::StreamOpened { id } => {
                trace!(stream = id, "peer opened stream");
                let ctx = state.ctx.clone();
                state.streams.entry(id).or_insert_with(|| {
                    let mut s = StreamState::with_default_capacity(
                        id,
                        ctx.stream_data.clone(),
                        ctx.stream_close.clone(),
                    );
                    s.is_new = false;
                    s
                });
            }
            Event::StreamData { id, data, fin: _ } => {
                let ctx = state.ctx.clone();
                let stream = state.streams.entry(id).or_insert_with(|| {
                    let mut s = StreamState::with_default_capacity(
                        id,
                        ctx.stream_data.clone(),
                        ctx.stream_close.clone(),
                    );
                    s.is_new = false;
                    s
                });
                state.engine.extend_max_stream_data(id, data.len() as u64);
                if let Some(cb) = stream.data_cb.clone() {
                    actions.push(Deferred::Data { id, cb, data });
                }
            }
            Event::StreamAcked { id, bytes } => {
                if let Some(stream) = state.streams.get_mut(&id) {
                    stream.acknowledge(bytes);
                    let acked = stream.acked_total;
                    if let Some(chunks) = stream.chunks.as_mut() {
                        if chunks.reap(acked) || chunks.wants_chunk() || chunks.is_done() {
                            actions.push(Deferred::Refill { id });
                        }
                    }
                }
            }
            Event::StreamClosed { id, app_code } => {
                if let Some(mut stream) = state.streams.remove(&id) {
                    if !stream.close_fired {
                        stream.close_fired = true;
                        if let Some(cb) = stream.close_cb.clone() {
                            actions.push(Deferred::CloseCb {
                                id,
                                cb,
                                code: app_code,
                            });
                        }
                    }
                }
            }
            Event::StreamsAvailable { bidi } => {
                trace!(bidi, "peer raised stream budget");
            }
            Event::Datagram(data) => {
                if let Some(cb) = state.ctx.dgram.clone() {
                    actions.push(Deferred::Datagram { cb, data });
                }
            }
            Event::ConnectionClosed { code } => {
                debug!(scid = %conn.source_cid, code, "peer closed connection");
                state.status = Status::Draining;
                state.timer_deadline = None;
                let mut teardown = teardown_streams(state);
                actions.append(&mut teardown);
                let deadline = Instant::now() + 3 * state.engine.pto();
                actions.push(Deferred::StartDrain { deadline });
            }
        }
        if state.status != Status::Open {
            break;
        }
    }
    actions
}

/// Emit CONNECTION_CLOSE and move to draining. Idempotent.
pub(crate) fn close_connection(conn: &ConnectionRef, code: u64, reason: &str) {
    let actions = {
        let mut state = conn.state.lock().unwrap();
        close_locked(&mut state, conn, code, reason)
    };
    run_deferred(conn, actions);
}

fn close_locked(
    state: &mut State,
    conn: &ConnectionRef,
    code: u64,
    reason: &str,
) -> Vec<Deferred> {
    if state.status != Status::Open {
        return Vec::new();
    }
    debug!(scid = %conn.source_cid, code, reason, "closing connection");
    let now = Instant::now();
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    match state
        .engine
        .close(now, &state.path, &mut buf, code, reason.as_bytes())
    {
        Ok(n) => {
            buf.truncate(n);
            let ecn = state.engine.last_ecn();
            conn.socket
                .send_or_queue(state.path.remote, buf, ecn, None);
        }
        Err(e) => warn!(scid = %conn.source_cid, "engine failed to build close packet: {e}"),
    }
    state.status = Status::Draining;
    state.timer_deadline = None;
    state.batch.clear();
    state.dgram_queue.clear();
    let mut actions = teardown_streams(state);
    actions.push(Deferred::StartDrain {
        deadline: now + 3 * state.engine.pto(),
    });
    actions
}

/// Fire the close callback (with the expired code) for every stream that has not
/// already seen it, and drop the stream table.
fn teardown_streams(state: &mut State) -> Vec<Deferred> {
    let mut actions = Vec::new();
    let streams = std::mem::take(&mut state.streams);
    for (id, mut stream) in streams {
        if !stream.close_fired {
            stream.close_fired = true;
            if let Some(cb) = stream.close_cb.clone() {
                actions.push(Deferred::CloseCb {
                    id,
                    cb,
                    code: STREAM_ERROR_CONNECTION_EXPIRED,
                });
            }
        }
    }
    actions
}

fn open_stream(
    conn: &ConnectionRef,
    data_cb: Option<StreamDataCb>,
    close_cb: Option<StreamCloseCb>,
) -> Result<Stream, crate::StreamError> {
    let id = {
        let mut state = conn.state.lock().unwrap();
        if state.status != Status::Open {
            return Err(crate::StreamError::ConnectionLost);
        }
        if state.engine.streams_bidi_left() == 0 {
            return Err(crate::StreamError::StreamsExhausted);
        }
        let id = state
            .engine
            .open_bidi_stream()
            .map_err(|_| crate::StreamError::StreamsExhausted)?;
        let data_cb = data_cb.or_else(|| state.ctx.stream_data.clone());
        let close_cb = close_cb.or_else(|| state.ctx.stream_close.clone());
        state
            .streams
            .insert(id, StreamState::with_default_capacity(id, data_cb, close_cb));
        id
    };
    conn.io_ready();
    Ok(Stream {
        conn: conn.clone(),
        id,
    })
}

/// Close one stream: graceful (FIN after drain) without an error code, abrupt engine
/// shutdown with one. Re-closing is a no-op.
pub(crate) fn close_stream(conn: &ConnectionRef, id: i64, error: Option<u64>) {
    let actions = {
        let mut state = conn.state.lock().unwrap();
        let Some(stream) = state.streams.get_mut(&id) else {
            return;
        };
        match error {
            None => {
                if stream.is_closing {
                    return;
                }
                stream.is_closing = true;
                stream.close_code = 0;
                Vec::new()
            }
            Some(code) => {
                let mut actions = Vec::new();
                stream.is_closing = true;
                stream.is_shutdown = true;
                if !stream.close_fired {
                    stream.close_fired = true;
                    if let Some(cb) = stream.close_cb.clone() {
                        actions.push(Deferred::CloseCb { id, cb, code });
                    }
                }
                state.streams.remove(&id);
                state.engine.shutdown_stream(id, code);
                actions
            }
        }
    };
    run_deferred(conn, actions);
    conn.io_ready();
}

/// A user data callback panicked: close the stream with the exception code; the
/// connection survives.
fn close_stream_exception(conn: &ConnectionRef, id: i64) -> Vec<Deferred> {
    error!(stream = id, "user callback panicked; closing stream");
    let mut state = conn.state.lock().unwrap();
    let Some(mut stream) = state.streams.remove(&id) else {
        return Vec::new();
    };
    state.engine.shutdown_stream(id, STREAM_ERROR_EXCEPTION);
    let mut actions = Vec::new();
    if !stream.close_fired {
        stream.close_fired = true;
        if let Some(cb) = stream.close_cb.clone() {
            actions.push(Deferred::CloseCb {
                id,
                cb,
                code: STREAM_ERROR_EXCEPTION,
            });
        }
    }
    actions
}

/// Run deferred work with no locks held. User callbacks are fenced with
/// `catch_unwind` so a panicking handler costs its stream, not the loop.
pub(crate) fn run_deferred(conn: &ConnectionRef, actions: Vec<Deferred>) {
    let mut queue = VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        match action {
            Deferred::Data { id, cb, data } => {
                let stream = Stream {
                    conn: conn.clone(),
                    id,
                };
                if catch_unwind(AssertUnwindSafe(|| cb(&stream, data))).is_err() {
                    queue.extend(close_stream_exception(conn, id));
                }
            }
            Deferred::CloseCb { id, cb, code } => {
                let stream = Stream {
                    conn: conn.clone(),
                    id,
                };
                if catch_unwind(AssertUnwindSafe(|| cb(&stream, code))).is_err() {
                    error!(stream = id, "close callback panicked");
                }
            }
            Deferred::Refill { id } => {
                refill_chunks(conn, id, &mut queue);
            }
            Deferred::ChunksDone { id, f } => {
                let stream = Stream {
                    conn: conn.clone(),
                    id,
                };
                if catch_unwind(AssertUnwindSafe(|| f(&stream))).is_err() {
                    queue.extend(close_stream_exception(conn, id));
                }
            }
            Deferred::Datagram { cb, data } => {
                let connection = Connection {
                    inner: conn.clone(),
                };
                if catch_unwind(AssertUnwindSafe(|| cb(&connection, data))).is_err() {
                    error!("datagram callback panicked");
                }
            }
            Deferred::StartDrain { deadline } => {
                if let Some(ep) = conn.endpoint.upgrade() {
                    ep.drain_connection(conn.source_cid, deadline);
                }
            }
            Deferred::NoteBlocked => {
                if let Some(ep) = conn.endpoint.upgrade() {
                    ep.note_blocked(conn.source_cid);
                }
            }
        }
    }
}

/// Ask the producer for chunks until `parallel` are in flight or it runs dry; fire
/// `on_done` once everything produced has been acknowledged.
fn refill_chunks(conn: &ConnectionRef, id: i64, queue: &mut VecDeque<Deferred>) {
    let handle = Stream {
        conn: conn.clone(),
        id,
    };
    loop {
        // Take the producer out while user code runs; a re-entrant producer must not
        // find the lock held.
        let mut producer = {
            let mut state = conn.state.lock().unwrap();
            let Some(stream) = state.streams.get_mut(&id) else {
                return;
            };
            let Some(chunks) = stream.chunks.as_mut() else {
                return;
            };
            if !chunks.wants_chunk() {
                break;
            }
            chunks.producer.take().expect("wants_chunk implies producer")
        };

        let chunk = match catch_unwind(AssertUnwindSafe(|| producer(&handle))) {
            Ok(chunk) => chunk,
            Err(_) => {
                queue.extend(close_stream_exception(conn, id));
                return;
            }
        };

        let mut state = conn.state.lock().unwrap();
        let Some(stream) = state.streams.get_mut(&id) else {
            return;
        };
        let Some(chunks) = stream.chunks.as_mut() else {
            return;
        };
        chunks.producer = Some(producer);
        match chunk {
            Some(data) if !data.is_empty() => {
                let before = stream.tx_queued;
                stream.queue_send(data);
                if stream.tx_queued > before {
                    let end = stream.tx_queued;
                    stream
                        .chunks
                        .as_mut()
                        .expect("just checked")
                        .inflight
                        .push_back(end);
                }
            }
            _ => {
                chunks.exhausted = true;
                break;
            }
        }
    }

    // Producer exhausted and every chunk acked: this run is complete.
    let done = {
        let mut state = conn.state.lock().unwrap();
        let Some(stream) = state.streams.get_mut(&id) else {
            return;
        };
        match stream.chunks.as_mut() {
            Some(chunks) if chunks.is_done() => {
                let f = chunks.on_done.take();
                stream.chunks = None;
                f
            }
            _ => None,
        }
    };
    if let Some(f) = done {
        queue.push_back(Deferred::ChunksDone { id, f });
    }
    conn.io_ready();
}
