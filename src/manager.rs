//! Connection manager: shared socket, slot table and maintenance thread

use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionParams, ConnectionShared, DisconnectReason, Link};
use crate::error::{ConnectionError, LiteError, Result};
use crate::metrics::{ManagerMetrics, MetricsSnapshot};
use crate::transport::{DatagramSocket, UdpTransport};
use bytes::Bytes;
use liteconn_core::{random_nonce, Flags, Packet};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Receive buffer size; anything larger than the configured datagram limit
/// is discarded after the read
const RECV_BUFFER_SIZE: usize = 65536;

/// A client's SYN waiting to be accepted
#[derive(Debug, Clone, Copy)]
struct ConnectRequest {
    addr: SocketAddr,
    nonce: u32,
    received_at: Instant,
}

/// Slots and request queue, guarded by one lock
struct SlotTable {
    slots: Vec<Option<Weak<ConnectionShared>>>,
    requests: VecDeque<ConnectRequest>,
    listening: bool,
}

impl SlotTable {
    fn live(&self) -> impl Iterator<Item = Arc<ConnectionShared>> + '_ {
        self.slots.iter().flatten().filter_map(Weak::upgrade)
    }

    /// First slot that is empty or whose occupant is dropped or Disconnected
    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| match slot {
            None => true,
            Some(weak) => weak.upgrade().map_or(true, |conn| conn.is_disconnected()),
        })
    }

    /// Random non-zero key not used by any slot occupant
    fn unused_key(&self) -> u32 {
        loop {
            let key = random_nonce();
            if !self.live().any(|conn| conn.routing_key() == key) {
                return key;
            }
        }
    }

    fn route(&self, session_id: u32) -> Option<Arc<ConnectionShared>> {
        self.live().find(|conn| conn.routing_key() == session_id)
    }
}

struct ManagerShared {
    config: ManagerConfig,
    local_addr: SocketAddr,
    socket: Weak<dyn DatagramSocket>,
    table: Mutex<SlotTable>,
    /// Signalled when a connection request is queued or listening changes
    incoming: Condvar,
    /// Wakes the maintenance thread early on shutdown
    wakeup: Condvar,
    shutdown: AtomicBool,
    metrics: ManagerMetrics,
}

impl ManagerShared {
    fn link(&self) -> Link {
        Link {
            socket: self.socket.clone(),
            local_addr: self.local_addr,
            params: ConnectionParams {
                timeouts: self.config.timeouts,
                queue_capacity: self.config.packet_queue_capacity,
                max_datagram_size: self.config.max_datagram_size,
            },
        }
    }

    fn run(self: Arc<Self>, socket: Arc<dyn DatagramSocket>) {
        debug!(addr = %self.local_addr, "Maintenance thread started");
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            self.drain(socket.as_ref(), &mut buf);
            self.maintain(Instant::now());

            let mut table = self.table.lock();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.wakeup.wait_for(&mut table, self.config.update_interval);
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
        debug!(addr = %self.local_addr, "Maintenance thread stopped");
    }

    /// Read and route every datagram currently buffered
    fn drain(&self, socket: &dyn DatagramSocket, buf: &mut [u8]) {
        loop {
            match socket.try_read_datagram(buf) {
                Ok(Some((len, from))) => self.route(&buf[..len], from),
                Ok(None) => break,
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "Datagram socket read failed");
                    break;
                }
            }
        }
    }

    fn route(&self, datagram: &[u8], from: SocketAddr) {
        ManagerMetrics::incr(&self.metrics.datagrams_received);

        let packet = if datagram.len() > self.config.max_datagram_size {
            None
        } else {
            Packet::decode(Bytes::copy_from_slice(datagram))
        };
        let Some(packet) = packet.filter(|p| p.header.flags.is_well_formed()) else {
            ManagerMetrics::incr(&self.metrics.datagrams_malformed);
            trace!(peer = %from, len = datagram.len(), "Discarding malformed datagram");
            return;
        };

        let header = packet.header;
        let target = self.table.lock().route(header.session_id);
        if let Some(conn) = target {
            ManagerMetrics::incr(&self.metrics.datagrams_routed);
            trace!(peer = %from, session = header.session_id, flags = %header.flags, "Routing datagram");
            conn.handle_datagram(from, packet, Instant::now());
            return;
        }

        if header.flags == Flags::SYN && header.session_id == 0 && header.id32 != 0 {
            self.queue_request(from, header.id32);
        } else {
            ManagerMetrics::incr(&self.metrics.datagrams_unrouted);
            trace!(peer = %from, session = header.session_id, flags = %header.flags, "No connection for datagram");
        }
    }

    fn queue_request(&self, addr: SocketAddr, nonce: u32) {
        let mut table = self.table.lock();
        if !table.listening {
            ManagerMetrics::incr(&self.metrics.datagrams_unrouted);
            trace!(peer = %addr, "Not listening, SYN ignored");
            return;
        }

        let queued = table
            .requests
            .iter()
            .any(|r| r.addr == addr && r.nonce == nonce);
        let live = table
            .live()
            .any(|conn| conn.origin() == Some((addr, nonce)) && !conn.is_disconnected());
        if queued || live {
            ManagerMetrics::incr(&self.metrics.requests_deduplicated);
            trace!(peer = %addr, nonce, "Duplicate connection request");
            return;
        }

        if table.requests.len() >= self.config.max_pending_connections {
            ManagerMetrics::incr(&self.metrics.requests_dropped);
            debug!(peer = %addr, "Connection request queue full");
            return;
        }

        table.requests.push_back(ConnectRequest {
            addr,
            nonce,
            received_at: Instant::now(),
        });
        ManagerMetrics::incr(&self.metrics.requests_queued);
        debug!(peer = %addr, nonce, queued = table.requests.len(), "Connection request queued");
        drop(table);
        self.incoming.notify_all();
    }

    /// Expire requests, advance every connection's timers, evict ended slots
    fn maintain(&self, now: Instant) {
        let live: Vec<Arc<ConnectionShared>> = {
            let mut table = self.table.lock();
            let expiry = self.config.timeouts.connection_timeout;
            let before = table.requests.len();
            table
                .requests
                .retain(|r| now.saturating_duration_since(r.received_at) < expiry);
            let expired = before - table.requests.len();
            if expired > 0 {
                self.metrics
                    .requests_dropped
                    .fetch_add(expired as u64, Ordering::Relaxed);
                debug!(expired, "Connection requests expired");
            }
            table.live().collect()
        };

        for conn in &live {
            conn.update(now);
        }

        {
            let mut table = self.table.lock();
            for (index, slot) in table.slots.iter_mut().enumerate() {
                let ended = match slot {
                    None => continue,
                    Some(weak) => weak.upgrade().map_or(true, |conn| conn.is_disconnected()),
                };
                if ended {
                    *slot = None;
                    ManagerMetrics::incr(&self.metrics.connections_evicted);
                    debug!(slot = index, "Evicted connection slot");
                }
            }
        }
        drop(live);
    }
}

/// Multiplexes LiteConn connections over one datagram socket.
///
/// The manager is the only strong owner of the socket and runs one
/// maintenance thread that reads the socket, routes datagrams by session id
/// and drives every connection's timers. Dropping the manager stops the
/// thread and disconnects every live connection with a FIN.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    socket: Arc<dyn DatagramSocket>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Bind a UDP socket to `addr`
    pub fn bind(addr: impl ToSocketAddrs, config: ManagerConfig) -> Result<Self> {
        let socket = UdpTransport::bind(addr)?;
        Self::with_socket(Arc::new(socket), config)
    }

    /// Run over any [`DatagramSocket`]
    pub fn with_socket(socket: Arc<dyn DatagramSocket>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(ManagerShared {
            table: Mutex::new(SlotTable {
                slots: vec![None; config.num_connections],
                requests: VecDeque::new(),
                listening: config.listening,
            }),
            incoming: Condvar::new(),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            metrics: ManagerMetrics::default(),
            socket: Arc::downgrade(&socket),
            local_addr,
            config,
        });

        let worker = {
            let shared = shared.clone();
            let socket = socket.clone();
            std::thread::Builder::new()
                .name("liteconn-maintenance".into())
                .spawn(move || shared.run(socket))?
        };

        info!(
            addr = %local_addr,
            slots = shared.config.num_connections,
            listening = shared.config.listening,
            "Connection manager started"
        );
        Ok(Self {
            shared,
            socket,
            worker: Some(worker),
        })
    }

    /// Open a connection to `addr`.
    ///
    /// With `Some(timeout)` this blocks until the handshake completes;
    /// with `None` the connection is returned while still Connecting.
    pub fn connect_peer(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<Connection> {
        let conn = {
            let mut table = self.shared.table.lock();
            let index = table
                .free_slot()
                .ok_or_else(|| LiteError::connection(ConnectionError::NoFreeSlot))?;
            let nonce = table.unused_key();
            let shared = ConnectionShared::connect(&self.shared.link(), addr, nonce);
            table.slots[index] = Some(Arc::downgrade(&shared));
            ManagerMetrics::incr(&self.shared.metrics.connections_created);
            Connection::new(shared)
        };

        if let Some(timeout) = timeout {
            Self::await_handshake(&conn, timeout)?;
        }
        Ok(conn)
    }

    /// Accept one queued connection request.
    ///
    /// Waits up to `timeout` (forever with `None`) for a request, answers it
    /// with SYN|ACK and returns the Pending connection. With
    /// `Some(wait_time)` it also blocks until the handshake completes.
    pub fn accept(
        &self,
        timeout: Option<Duration>,
        wait_time: Option<Duration>,
    ) -> Result<Connection> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let conn = {
            let mut table = self.shared.table.lock();
            if !table.listening && table.requests.is_empty() {
                return Err(LiteError::connection(ConnectionError::NotListening));
            }
            if table.free_slot().is_none() {
                return Err(LiteError::connection(ConnectionError::NoFreeSlot));
            }

            let request = loop {
                if let Some(request) = table.requests.pop_front() {
                    break request;
                }
                if self.shared.shutdown.load(Ordering::Acquire) {
                    return Err(LiteError::manager("manager is shutting down"));
                }
                if !table.listening {
                    return Err(LiteError::connection(ConnectionError::NotListening));
                }
                match deadline {
                    Some(deadline) => {
                        if self.shared.incoming.wait_until(&mut table, deadline).timed_out()
                            && table.requests.is_empty()
                        {
                            let waited = timeout.map_or(0, |t| t.as_millis() as u64);
                            return Err(LiteError::timeout(waited));
                        }
                    }
                    None => self.shared.incoming.wait(&mut table),
                }
            };

            let Some(index) = table.free_slot() else {
                table.requests.push_front(request);
                return Err(LiteError::connection(ConnectionError::NoFreeSlot));
            };
            let session = table.unused_key();
            let shared = ConnectionShared::accept(
                &self.shared.link(),
                request.addr,
                request.nonce,
                session,
            );
            table.slots[index] = Some(Arc::downgrade(&shared));
            ManagerMetrics::incr(&self.shared.metrics.connections_created);
            info!(peer = %request.addr, session, slot = index, "Accepted connection");
            Connection::new(shared)
        };

        if let Some(wait_time) = wait_time {
            Self::await_handshake(&conn, wait_time)?;
        }
        Ok(conn)
    }

    fn await_handshake(conn: &Connection, timeout: Duration) -> Result<()> {
        if conn.wait_for_connection_complete(Some(timeout)) {
            return Ok(());
        }
        if conn.is_disconnected() {
            Err(LiteError::connection(ConnectionError::HandshakeFailed))
        } else {
            Err(LiteError::timeout(timeout.as_millis() as u64))
        }
    }

    /// Start or stop queueing inbound connection requests.
    ///
    /// Requests already queued stay acceptable after listening stops.
    pub fn set_listening(&self, listening: bool) {
        self.shared.table.lock().listening = listening;
        self.shared.incoming.notify_all();
        debug!(addr = %self.shared.local_addr, listening, "Listening changed");
    }

    pub fn is_listening(&self) -> bool {
        self.shared.table.lock().listening
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Live, non-disconnected connections in the slot table
    pub fn connection_count(&self) -> usize {
        self.shared
            .table
            .lock()
            .live()
            .filter(|conn| !conn.is_disconnected())
            .count()
    }

    /// Connection requests waiting for `accept`
    pub fn pending_count(&self) -> usize {
        self.shared.table.lock().requests.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.num_connections
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// The socket shared by every connection of this manager
    pub fn socket(&self) -> &Arc<dyn DatagramSocket> {
        &self.socket
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        {
            let _table = self.shared.table.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.wakeup.notify_all();
        self.shared.incoming.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(addr = %self.shared.local_addr, "Maintenance thread panicked");
            }
        }

        let live: Vec<Arc<ConnectionShared>> = {
            let mut table = self.shared.table.lock();
            let live = table.live().collect();
            table.slots.iter_mut().for_each(|slot| *slot = None);
            table.requests.clear();
            live
        };
        for conn in &live {
            conn.close(DisconnectReason::ManagerClosed);
        }
        info!(addr = %self.shared.local_addr, closed = live.len(), "Connection manager stopped");
    }
}
