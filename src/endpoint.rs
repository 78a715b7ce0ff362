use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::builders::{ConnectOptions, IoContext, ListenOptions};
use crate::connection::{self, Connection, ConnectionRef};
use crate::error::{ConfigError, ConnectError, ERROR_TCP};
use crate::network::NetHandle;
use crate::packet::{self, Header, LongType};
use crate::types::{Address, ConnectionId, Direction, Packet, Path, MAX_CID_LEN};
use crate::udp::UdpSocket;
use crate::{IO_LOOP_BOUND, SUPPORTED_VERSION};

/// How often the endpoint sweeps its draining queue.
const EXPIRY_INTERVAL: Duration = Duration::from_millis(250);

/// A QUIC endpoint: one UDP socket hosting many connections.
///
/// May act as client, server, or both. Cheap to clone; all clones refer to the same
/// socket and connection table.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

pub(crate) struct EndpointInner {
    net: NetHandle,
    socket: Arc<UdpSocket>,
    local: Address,
    state: Mutex<EpState>,
    shutdown_trigger: Notify,
}

struct EpState {
    /// Live connections keyed by their *local* CID: the CID peers put in the
    /// destination field of packets they send us. Exactly one entry per connection.
    conns: FxHashMap<ConnectionId, ConnectionRef>,
    /// Draining connections pinned until their deadline, ordered by it.
    draining: BTreeMap<(Instant, u64), ConnectionId>,
    drain_seq: u64,
    /// Connections with a batch stuck behind a blocked socket, awaiting a
    /// writability kick.
    blocked: FxHashSet<ConnectionId>,
    inbound_ctx: Option<Arc<IoContext>>,
    outbound_ctx: Option<Arc<IoContext>>,
    accepting_inbound: bool,
    dead: bool,
}

impl Endpoint {
    /// Bind a socket and start the endpoint driver. Loop thread only.
    pub(crate) fn bind(net: NetHandle, local: Address) -> Result<Self, ConfigError> {
        let socket = Arc::new(UdpSocket::bind(local)?);
        let local = socket.local();
        let inner = Arc::new(EndpointInner {
            net,
            socket,
            local,
            state: Mutex::new(EpState {
                conns: FxHashMap::default(),
                draining: BTreeMap::new(),
                drain_seq: 0,
                blocked: FxHashSet::default(),
                inbound_ctx: None,
                outbound_ctx: None,
                accepting_inbound: false,
                dead: false,
            }),
            shutdown_trigger: Notify::new(),
        });
        debug!(%local, "endpoint bound");
        tokio::spawn(drive(inner.clone()));
        Ok(Self { inner })
    }

    /// The bound local address.
    pub fn local(&self) -> Address {
        self.inner.local
    }

    /// Install the inbound context and begin accepting connections.
    pub fn listen(&self, opts: ListenOptions) -> Result<(), ConfigError> {
        let inner = self.inner.clone();
        self.inner.net.call_get(move || {
            let mut state = inner.state.lock().unwrap();
            state.inbound_ctx = Some(Arc::new(opts.into_context()));
            state.accepting_inbound = true;
            debug!(local = %inner.local, "inbound context ready for incoming connections");
        })?;
        Ok(())
    }

    /// Open an outbound connection to `remote`.
    ///
    /// A fresh local CID is drawn by rejection sampling against the in-use set, the
    /// connection is installed, and its first flight goes out asynchronously; the
    /// returned handle is usable immediately.
    pub fn connect(
        &self,
        remote: Address,
        opts: ConnectOptions,
    ) -> Result<Connection, ConnectError> {
        let inner = self.inner.clone();
        self.inner
            .net
            .call_get(move || {
                let ctx = Arc::new(opts.into_context());
                let mut state = inner.state.lock().unwrap();
                if state.dead {
                    return Err(ConnectError::NotOutbound);
                }
                state.outbound_ctx = Some(ctx.clone());

                // Retry until the CID is unused; collisions among 160-bit random IDs
                // are effectively impossible but the map must stay collision-free.
                let local_cid = loop {
                    let cid = ConnectionId::random(MAX_CID_LEN);
                    if !state.conns.contains_key(&cid) {
                        break cid;
                    }
                };
                let remote_cid = ConnectionId::random(MAX_CID_LEN);
                let path = Path::new(inner.local, remote);
                let conn = connection::new_connection(
                    inner.net.clone(),
                    inner.socket.clone(),
                    Arc::downgrade(&inner),
                    ctx,
                    local_cid,
                    remote_cid,
                    path,
                )?;
                state.conns.insert(local_cid, conn.clone());
                Ok(Connection { inner: conn })
            })
            .map_err(|e| ConnectError::Config(ConfigError::Call(e)))?
    }

    /// All live connections, optionally filtered by direction.
    pub fn get_all_conns(&self, dir: Option<Direction>) -> Vec<Connection> {
        let inner = self.inner.clone();
        self.inner
            .net
            .call_get(move || {
                let state = inner.state.lock().unwrap();
                state
                    .conns
                    .values()
                    .filter(|c| dir.map_or(true, |d| c.direction == d))
                    .map(|c| Connection { inner: c.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close every connection (optionally one direction only). Loop thread only.
    pub(crate) fn close_conns(&self, dir: Option<Direction>) {
        let conns: Vec<ConnectionRef> = {
            let state = self.inner.state.lock().unwrap();
            state
                .conns
                .values()
                .filter(|c| dir.map_or(true, |d| c.direction == d))
                .cloned()
                .collect()
        };
        for conn in conns {
            connection::close_connection(&conn, 0, "NO_ERROR");
        }
    }

    /// Tear the endpoint down: retire every connection and stop the driver.
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl EndpointInner {
    /// Pin a draining connection until `deadline`, after which `check_timeouts`
    /// removes it for good.
    pub(crate) fn drain_connection(&self, cid: ConnectionId, deadline: Instant) {
        let mut state = self.state.lock().unwrap();
        if !state.conns.contains_key(&cid) {
            return;
        }
        let seq = state.drain_seq;
        state.drain_seq += 1;
        state.draining.insert((deadline, seq), cid);
        trace!(%cid, ?deadline, "connection draining");
    }

    /// Remember that `cid` has a send batch stuck behind EAGAIN; it gets an
    /// `io_ready` kick on the next writability tick.
    pub(crate) fn note_blocked(&self, cid: ConnectionId) {
        self.state.lock().unwrap().blocked.insert(cid);
    }

    fn shutdown(&self) {
        let conns: Vec<ConnectionRef> = {
            let mut state = self.state.lock().unwrap();
            state.dead = true;
            state.accepting_inbound = false;
            state.draining.clear();
            state.blocked.clear();
            state.conns.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.retire();
        }
        self.shutdown_trigger.notify_one();
    }
}

/// The endpoint driver: socket readability, the draining sweep, and the writability
/// path for queued control packets and blocked connections.
async fn drive(ep: Arc<EndpointInner>) {
    let mut recv_buf = vec![0u8; 64 * 1024];
    let mut expiry = tokio::time::interval(EXPIRY_INTERVAL);
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let wants_writable =
            ep.socket.has_queued() || !ep.state.lock().unwrap().blocked.is_empty();

        tokio::select! {
            r = ep.socket.readable() => match r {
                Ok(()) => {
                    if !drive_recv(&ep, &mut recv_buf) {
                        break;
                    }
                }
                Err(e) => {
                    error!(local = %ep.local, "socket wait failed: {e}");
                    fatal_endpoint(&ep);
                    break;
                }
            },
            _ = expiry.tick() => check_timeouts(&ep, Instant::now()),
            w = ep.socket.writable(), if wants_writable => {
                if w.is_ok() {
                    ep.socket.flush_queued();
                    kick_blocked(&ep);
                }
            },
            _ = ep.shutdown_trigger.notified() => break,
        }
    }
    trace!(local = %ep.local, "endpoint driver finished");
}

/// Pull datagrams until the socket would block (bounded per wake-up); false means a
/// fatal socket error tore the endpoint down.
fn drive_recv(ep: &Arc<EndpointInner>, buf: &mut [u8]) -> bool {
    for _ in 0..IO_LOOP_BOUND {
        match ep.socket.try_recv(buf) {
            Ok(Some(pkt)) => handle_packet(ep, pkt),
            Ok(None) => break,
            Err(e) => {
                error!(local = %ep.local, "fatal receive error: {e}");
                fatal_endpoint(ep);
                return false;
            }
        }
    }
    true
}

/// Unrecoverable socket failure: close every connection, then stop.
fn fatal_endpoint(ep: &Arc<EndpointInner>) {
    let conns: Vec<ConnectionRef> = {
        let mut state = ep.state.lock().unwrap();
        state.dead = true;
        state.accepting_inbound = false;
        state.conns.values().cloned().collect()
    };
    for conn in &conns {
        connection::close_connection(conn, ERROR_TCP, "endpoint failure");
        conn.retire();
    }
    ep.state.lock().unwrap().conns.clear();
}

/// Demultiplex one datagram by destination CID.
fn handle_packet(ep: &Arc<EndpointInner>, pkt: Packet) {
    let Some(header) = packet::parse_header(&pkt.data, MAX_CID_LEN) else {
        trace!(from = %pkt.path.remote, "dropping unparseable packet");
        return;
    };
    let dcid = *header.dcid();

    let existing = { ep.state.lock().unwrap().conns.get(&dcid).cloned() };
    if let Some(conn) = existing {
        if conn.is_draining() {
            trace!(cid = %dcid, "absorbing packet for draining connection");
            return;
        }
        connection::read_packet(&conn, &pkt);
        return;
    }

    match header {
        Header::Long {
            version,
            ty: LongType::Initial,
            dcid,
            scid,
        } => {
            let ctx = {
                let state = ep.state.lock().unwrap();
                if !state.accepting_inbound || state.dead {
                    trace!(from = %pkt.path.remote, "not accepting inbound; dropping Initial");
                    return;
                }
                state.inbound_ctx.clone()
            };
            let Some(ctx) = ctx else { return };

            if version != SUPPORTED_VERSION {
                debug!(version = format_args!("{version:#x}"), from = %pkt.path.remote,
                    "unsupported version; sending Version Negotiation");
                let vn = packet::version_negotiation(&scid, &dcid, &[SUPPORTED_VERSION]);
                ep.socket.send_or_queue(pkt.path.remote, vn, None, None);
                return;
            }
            accept_initial_connection(ep, ctx, &pkt, dcid, scid);
        }
        _ => {
            trace!(cid = %dcid, "dropping packet for unknown connection");
        }
    }
}

/// A valid Initial with an unseen CID: construct the inbound connection and feed it the
/// packet. We adopt the client-chosen destination CID as our local CID so short-header
/// packets route before the handshake completes.
fn accept_initial_connection(
    ep: &Arc<EndpointInner>,
    ctx: Arc<IoContext>,
    pkt: &Packet,
    local_cid: ConnectionId,
    remote_cid: ConnectionId,
) {
    debug!(from = %pkt.path.remote, cid = %local_cid, "accepting inbound connection");
    let conn = match connection::new_connection(
        ep.net.clone(),
        ep.socket.clone(),
        Arc::downgrade(ep),
        ctx,
        local_cid,
        remote_cid,
        pkt.path,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(from = %pkt.path.remote, "failed to accept connection: {e}");
            return;
        }
    };
    ep.state
        .lock()
        .unwrap()
        .conns
        .insert(local_cid, conn.clone());
    connection::read_packet(&conn, pkt);
}

/// Remove every draining entry whose deadline has passed, deleting the connection.
fn check_timeouts(ep: &Arc<EndpointInner>, now: Instant) {
    let expired: Vec<(ConnectionId, ConnectionRef)> = {
        let mut state = ep.state.lock().unwrap();
        let due: Vec<(Instant, u64)> = state
            .draining
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        due.into_iter()
            .filter_map(|key| {
                let cid = state.draining.remove(&key)?;
                state.blocked.remove(&cid);
                state.conns.remove(&cid).map(|c| (cid, c))
            })
            .collect()
    };
    for (cid, conn) in expired {
        debug!(%cid, "draining period ended, deleting connection");
        conn.retire();
    }
}

/// Writability returned: give every blocked connection another shot at its batch.
fn kick_blocked(ep: &Arc<EndpointInner>) {
    let conns: Vec<ConnectionRef> = {
        let mut state = ep.state.lock().unwrap();
        let cids: Vec<ConnectionId> = state.blocked.drain().collect();
        cids.iter()
            .filter_map(|cid| state.conns.get(cid).cloned())
            .collect()
    };
    for conn in conns {
        conn.io_ready();
    }
}
