//! One LiteConn peer relationship
//!
//! A connection runs the handshake, heartbeat, reliable retransmission and
//! request/response state machine for a single session. Inbound datagrams
//! arrive through the manager's router ([`ConnectionShared::handle_datagram`])
//! and timers advance from the manager's maintenance tick
//! ([`ConnectionShared::update`]); everything else is called directly by
//! application threads.
//!
//! The shared socket is owned by the [`ConnectionManager`]. A connection only
//! holds a weak reference to it, so once the manager is dropped every send
//! becomes a no-op and the connection is already `Disconnected`.
//!
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use crate::error::{ConnectionError, LiteError, Result};
use crate::handle::{Message, RequestHandle, ResponseHandle, ResponseSlot};
use crate::transport::DatagramSocket;
use bytes::Bytes;
use liteconn_core::{
    encode_conversation, index_at_or_after, split_conversation, ConnectionStats, CorrelationId,
    Flags, Header, Packet, PacketIndex, ReliabilityId, SessionId, TimeoutSetting,
    CONVERSATION_PREFIX_SIZE,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Client waiting for the server's SYN|ACK
    Connecting,
    /// Server waiting for the client's ACK
    Pending,
    Connected,
    Disconnected,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called or the `Connection` was dropped
    Local,
    /// The peer sent FIN
    PeerClosed,
    /// Nothing was received for the connection timeout
    TimedOut,
    /// The owning manager shut down
    ManagerClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => write!(f, "closed locally"),
            DisconnectReason::PeerClosed => write!(f, "closed by peer"),
            DisconnectReason::TimedOut => write!(f, "timed out"),
            DisconnectReason::ManagerClosed => write!(f, "manager closed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Connecting {
        nonce: u32,
        next_syn: Instant,
    },
    Pending {
        client_nonce: u32,
        next_syn: Instant,
    },
    Connected,
    Disconnected(DisconnectReason),
}

impl Phase {
    fn status(&self) -> ConnectionStatus {
        match self {
            Phase::Connecting { .. } => ConnectionStatus::Connecting,
            Phase::Pending { .. } => ConnectionStatus::Pending,
            Phase::Connected => ConnectionStatus::Connected,
            Phase::Disconnected(_) => ConnectionStatus::Disconnected,
        }
    }
}

/// Per-connection limits taken from the manager configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionParams {
    pub timeouts: TimeoutSetting,
    pub queue_capacity: usize,
    pub max_datagram_size: usize,
}

/// What a new connection needs from its manager
#[derive(Clone)]
pub(crate) struct Link {
    pub socket: Weak<dyn DatagramSocket>,
    pub local_addr: SocketAddr,
    pub params: ConnectionParams,
}

struct Retransmit {
    packet: Packet,
    next_resend: Instant,
}

struct SessionState {
    phase: Phase,
    session_id: SessionId,
    peer_addr: SocketAddr,
    last_recv_index: Option<PacketIndex>,

    pkt_index: PacketIndex,
    reliability_index: ReliabilityId,
    request_index: CorrelationId,

    pending_retransmits: BTreeMap<ReliabilityId, Retransmit>,
    recent_acks: HashMap<ReliabilityId, Instant>,
    outstanding: HashMap<CorrelationId, Arc<ResponseSlot>>,
    owed: HashSet<CorrelationId>,
    delivered: VecDeque<Message>,

    last_send: Instant,
    last_recv: Instant,
    stats: ConnectionStats,
}

impl SessionState {
    fn new(phase: Phase, session_id: SessionId, peer_addr: SocketAddr, now: Instant) -> Self {
        Self {
            phase,
            session_id,
            peer_addr,
            last_recv_index: None,
            pkt_index: 0,
            reliability_index: 0,
            request_index: 0,
            pending_retransmits: BTreeMap::new(),
            recent_acks: HashMap::new(),
            outstanding: HashMap::new(),
            owed: HashSet::new(),
            delivered: VecDeque::new(),
            last_send: now,
            last_recv: now,
            stats: ConnectionStats::default(),
        }
    }

    fn next_packet_index(&mut self) -> PacketIndex {
        let index = self.pkt_index;
        self.pkt_index = self.pkt_index.wrapping_add(1);
        index
    }

    /// Reliability ids skip 0, which marks "no delivery ack" on the wire
    fn next_reliability_id(&mut self) -> ReliabilityId {
        self.reliability_index = self.reliability_index.wrapping_add(1);
        if self.reliability_index == 0 {
            self.reliability_index = 1;
        }
        self.reliability_index
    }

    fn next_request_id(&mut self) -> CorrelationId {
        self.request_index = self.request_index.wrapping_add(1);
        if self.request_index == 0 {
            self.request_index = 1;
        }
        self.request_index
    }

    fn is_disconnected(&self) -> bool {
        matches!(self.phase, Phase::Disconnected(_))
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.phase {
            Phase::Connected => Ok(()),
            Phase::Disconnected(_) => Err(LiteError::connection(ConnectionError::Closed)),
            _ => Err(LiteError::connection(ConnectionError::NotConnected)),
        }
    }
}

/// Work deferred until the connection lock is released.
///
/// Resolving a slot or dropping a message can run `ResponseHandle::drop`,
/// which locks the connection again.
#[derive(Default)]
struct Effects {
    resolved: Vec<(Arc<ResponseSlot>, Option<Message>)>,
    discarded: Vec<Message>,
}

impl Effects {
    fn apply(self) {
        for (slot, outcome) in self.resolved {
            drop(slot.resolve(outcome));
        }
        drop(self.discarded);
    }
}

/// Outcome of offering a data-plane datagram to the connection
enum Offer {
    Accepted,
    QueueFull,
}

/// State shared by the application's [`Connection`], the manager's slot and
/// every handle bound to this connection.
pub(crate) struct ConnectionShared {
    state: Mutex<SessionState>,
    cond: Condvar,
    /// Session id the manager routes on: the client nonce while Connecting
    routing_key: AtomicU32,
    socket: Weak<dyn DatagramSocket>,
    params: ConnectionParams,
    local_addr: SocketAddr,
    /// `(address, client nonce)` of the request a server-side connection
    /// was accepted from
    origin: Option<(SocketAddr, u32)>,
    self_ref: Weak<ConnectionShared>,
}

impl ConnectionShared {
    /// Client side: start in Connecting and send the first SYN
    pub(crate) fn connect(link: &Link, peer: SocketAddr, nonce: u32) -> Arc<Self> {
        let now = Instant::now();
        let phase = Phase::Connecting {
            nonce,
            next_syn: now + link.params.timeouts.connection_retry_interval,
        };
        let shared = Self::create(link, SessionState::new(phase, 0, peer, now), nonce, None);
        {
            let mut st = shared.state.lock();
            let mut syn = Packet::control(Header::new(0, Flags::SYN).with_id32(nonce));
            shared.transmit(&mut st, &mut syn, now);
        }
        debug!(peer = %peer, nonce, "Connecting");
        shared
    }

    /// Server side: start in Pending and answer the client's SYN
    pub(crate) fn accept(
        link: &Link,
        peer: SocketAddr,
        client_nonce: u32,
        session: SessionId,
    ) -> Arc<Self> {
        let now = Instant::now();
        let phase = Phase::Pending {
            client_nonce,
            next_syn: now + link.params.timeouts.connection_retry_interval,
        };
        let shared = Self::create(
            link,
            SessionState::new(phase, session, peer, now),
            session,
            Some((peer, client_nonce)),
        );
        {
            let mut st = shared.state.lock();
            let mut syn_ack = Packet::control(
                Header::new(client_nonce, Flags::SYN | Flags::ACK).with_id32(session),
            );
            shared.transmit(&mut st, &mut syn_ack, now);
        }
        debug!(peer = %peer, session, "Accepted connection request");
        shared
    }

    fn create(
        link: &Link,
        state: SessionState,
        routing_key: u32,
        origin: Option<(SocketAddr, u32)>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
            routing_key: AtomicU32::new(routing_key),
            socket: link.socket.clone(),
            params: link.params,
            local_addr: link.local_addr,
            origin,
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn routing_key(&self) -> u32 {
        self.routing_key.load(Ordering::Acquire)
    }

    pub(crate) fn origin(&self) -> Option<(SocketAddr, u32)> {
        self.origin
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.state.lock().is_disconnected()
    }

    // ── sending ─────────────────────────────────────────────────────────

    /// Stamp a fresh index and put `packet` on the wire
    fn transmit(&self, st: &mut SessionState, packet: &mut Packet, now: Instant) {
        packet.header.index = st.next_packet_index();
        let datagram = packet.encode();
        st.last_send = now;

        let Some(socket) = self.socket.upgrade() else {
            trace!(session = st.session_id, "Socket released, datagram not sent");
            return;
        };
        match socket.send_datagram(&datagram, st.peer_addr) {
            Ok(_) => {
                st.stats.datagrams_sent += 1;
                st.stats.bytes_sent += datagram.len() as u64;
            }
            Err(e) => {
                trace!(session = st.session_id, peer = %st.peer_addr, error = %e, "Datagram send failed");
            }
        }
    }

    fn send_control(&self, st: &mut SessionState, header: Header, now: Instant) {
        let mut packet = Packet::control(header);
        self.transmit(st, &mut packet, now);
    }

    fn send_ack(&self, st: &mut SessionState, id32: ReliabilityId, now: Instant) {
        let header = Header::new(st.session_id, Flags::ACK).with_id32(id32);
        self.send_control(st, header, now);
    }

    /// Send with IMP and keep retransmitting until acked
    fn send_reliable(
        &self,
        st: &mut SessionState,
        flags: Flags,
        id64: CorrelationId,
        payload: Bytes,
        now: Instant,
    ) -> ReliabilityId {
        let id32 = st.next_reliability_id();
        let header = Header::new(st.session_id, flags | Flags::IMP)
            .with_id32(id32)
            .with_id64(id64);
        let mut packet = Packet::new(header, payload);
        self.transmit(st, &mut packet, now);
        st.pending_retransmits.insert(
            id32,
            Retransmit {
                packet,
                next_resend: now + self.params.timeouts.imp_retry_interval,
            },
        );
        trace!(session = st.session_id, id32, id64, flags = %header.flags, "Reliable send");
        id32
    }

    fn check_size(&self, payload_len: usize) -> Result<()> {
        let size = Header::SIZE + payload_len;
        if size > self.params.max_datagram_size {
            return Err(LiteError::buffer(format!(
                "datagram of {size} bytes exceeds the {} byte limit",
                self.params.max_datagram_size
            )));
        }
        Ok(())
    }

    // ── receiving ───────────────────────────────────────────────────────

    /// Process one datagram routed to this connection
    pub(crate) fn handle_datagram(&self, from: SocketAddr, packet: Packet, now: Instant) {
        let mut effects = Effects::default();
        {
            let mut st = self.state.lock();
            if st.is_disconnected() {
                return;
            }
            if !Self::is_valid(&packet) {
                st.stats.malformed_discarded += 1;
                trace!(session = st.session_id, flags = %packet.header.flags, "Discarding malformed datagram");
                return;
            }
            self.on_receive(&mut st, from, &packet, now);
            self.dispatch(&mut st, packet, now, &mut effects);
        }
        self.cond.notify_all();
        effects.apply();
    }

    fn is_valid(packet: &Packet) -> bool {
        let flags = packet.header.flags;
        if !flags.is_well_formed() {
            return false;
        }
        let conversation = Flags::DATA | Flags::ACK | Flags::REQ;
        !(flags.contains(conversation) && packet.payload.len() < CONVERSATION_PREFIX_SIZE)
    }

    /// Liveness and roaming bookkeeping shared by every valid datagram
    fn on_receive(&self, st: &mut SessionState, from: SocketAddr, packet: &Packet, now: Instant) {
        st.last_recv = now;
        st.stats.datagrams_received += 1;
        st.stats.bytes_received += packet.size() as u64;

        let index = packet.header.index;
        let fresh = st
            .last_recv_index
            .map_or(true, |last| index_at_or_after(index, last));
        if fresh {
            st.last_recv_index = Some(index);
            if st.peer_addr != from {
                debug!(session = st.session_id, old = %st.peer_addr, new = %from, "Peer address changed");
                st.peer_addr = from;
            }
        }
    }

    fn dispatch(&self, st: &mut SessionState, packet: Packet, now: Instant, effects: &mut Effects) {
        let header = packet.header;
        match st.phase {
            Phase::Disconnected(_) => {}
            Phase::Connecting { .. } => {
                if header.flags == Flags::SYN | Flags::ACK && header.id32 != 0 {
                    st.session_id = header.id32;
                    self.routing_key.store(header.id32, Ordering::Release);
                    st.phase = Phase::Connected;
                    self.send_ack(st, 0, now);
                    info!(session = st.session_id, peer = %st.peer_addr, "Connection established");
                }
            }
            Phase::Pending { .. } => {
                if header.flags.contains(Flags::SYN) {
                    return;
                }
                st.phase = Phase::Connected;
                info!(session = st.session_id, peer = %st.peer_addr, "Connection established");
                let handshake_ack = header.flags.is_bare_ack()
                    && header.id32 == 0
                    && packet.payload.is_empty();
                if !handshake_ack {
                    self.process(st, packet, now, effects);
                }
            }
            Phase::Connected => self.process(st, packet, now, effects),
        }
    }

    /// Connected-phase handling
    fn process(&self, st: &mut SessionState, packet: Packet, now: Instant, effects: &mut Effects) {
        let header = packet.header;
        let flags = header.flags;

        if flags.contains(Flags::SYN) {
            // Our handshake ACK was lost and the peer is still retrying.
            self.send_ack(st, 0, now);
            return;
        }
        if flags == Flags::FIN {
            self.force_disconnect(st, DisconnectReason::PeerClosed, effects);
            return;
        }
        if flags.contains(Flags::HBT) {
            if !flags.contains(Flags::ACK) {
                let reply = Header::new(st.session_id, Flags::HBT | Flags::ACK);
                self.send_control(st, reply, now);
            }
            return;
        }
        if flags.is_bare_ack() {
            if header.id32 != 0 && st.pending_retransmits.remove(&header.id32).is_some() {
                trace!(session = st.session_id, id32 = header.id32, "Delivery confirmed");
            }
            return;
        }

        if !flags.contains(Flags::IMP) {
            if let Offer::QueueFull = self.offer(st, header, packet.payload, now, effects) {
                st.stats.unreliable_dropped += 1;
                trace!(session = st.session_id, "Queue full, unreliable datagram dropped");
            }
            return;
        }

        if st.recent_acks.contains_key(&header.id32) {
            st.stats.duplicates_suppressed += 1;
            self.send_ack(st, header.id32, now);
            return;
        }
        match self.offer(st, header, packet.payload, now, effects) {
            Offer::Accepted => {
                self.send_ack(st, header.id32, now);
                let expiry = now + self.params.timeouts.reply_keep_duration;
                st.recent_acks.insert(header.id32, expiry);
            }
            Offer::QueueFull => {
                // No ack: the sender retries until there is room.
                st.stats.deliveries_deferred += 1;
                trace!(session = st.session_id, id32 = header.id32, "Queue full, delivery deferred");
            }
        }
    }

    /// Apply a data-plane datagram to the request tables and delivered queue
    fn offer(
        &self,
        st: &mut SessionState,
        header: Header,
        payload: Bytes,
        now: Instant,
        effects: &mut Effects,
    ) -> Offer {
        let flags = header.flags;
        let id64 = header.id64;

        if flags.contains(Flags::CXL) {
            if flags.contains(Flags::ACK) {
                if let Some(slot) = st.outstanding.remove(&id64) {
                    debug!(session = st.session_id, id64, "Request rejected by peer");
                    effects.resolved.push((slot, None));
                }
            } else if st.owed.remove(&id64) {
                debug!(session = st.session_id, id64, "Request cancelled by peer");
            }
            return Offer::Accepted;
        }

        if flags.contains(Flags::ACK) {
            if !flags.contains(Flags::REQ) {
                if let Some(slot) = st.outstanding.remove(&id64) {
                    effects.resolved.push((slot, Some(Message::data(payload))));
                }
                return Offer::Accepted;
            }

            let Ok((next, data)) = split_conversation(payload) else {
                return Offer::Accepted;
            };
            match st.outstanding.remove(&id64) {
                Some(slot) => {
                    st.owed.insert(next);
                    let handle = ResponseHandle::new(next, self.self_ref.clone());
                    effects
                        .resolved
                        .push((slot, Some(Message::request(data, handle))));
                }
                None => {
                    trace!(session = st.session_id, id64, next, "Continuation for unknown request, rejecting");
                    self.send_reliable(st, Flags::ACK | Flags::CXL, next, Bytes::new(), now);
                }
            }
            return Offer::Accepted;
        }

        if st.delivered.len() >= self.params.queue_capacity {
            return Offer::QueueFull;
        }
        let message = if flags.contains(Flags::REQ) {
            st.owed.insert(id64);
            Message::request(payload, ResponseHandle::new(id64, self.self_ref.clone()))
        } else {
            Message::data(payload)
        };
        st.delivered.push_back(message);
        Offer::Accepted
    }

    // ── timers ──────────────────────────────────────────────────────────

    /// Periodic maintenance: handshake retries, retransmission, heartbeat
    /// and liveness timeout
    pub(crate) fn update(&self, now: Instant) {
        let mut effects = Effects::default();
        {
            let mut st = self.state.lock();
            self.tick(&mut st, now, &mut effects);
        }
        self.cond.notify_all();
        effects.apply();
    }

    fn tick(&self, st: &mut SessionState, now: Instant, effects: &mut Effects) {
        let timeouts = self.params.timeouts;
        if st.is_disconnected() {
            return;
        }
        if now.saturating_duration_since(st.last_recv) >= timeouts.connection_timeout {
            self.force_disconnect(st, DisconnectReason::TimedOut, effects);
            return;
        }

        match st.phase {
            Phase::Connecting { nonce, next_syn } => {
                if now >= next_syn {
                    debug!(peer = %st.peer_addr, nonce, "Retrying SYN");
                    self.send_control(st, Header::new(0, Flags::SYN).with_id32(nonce), now);
                    st.phase = Phase::Connecting {
                        nonce,
                        next_syn: now + timeouts.connection_retry_interval,
                    };
                }
            }
            Phase::Pending {
                client_nonce,
                next_syn,
            } => {
                if now >= next_syn {
                    let session = st.session_id;
                    debug!(peer = %st.peer_addr, session, "Retrying SYN and SYN|ACK");
                    self.send_control(st, Header::new(session, Flags::SYN), now);
                    self.send_control(
                        st,
                        Header::new(client_nonce, Flags::SYN | Flags::ACK).with_id32(session),
                        now,
                    );
                    st.phase = Phase::Pending {
                        client_nonce,
                        next_syn: now + timeouts.connection_retry_interval,
                    };
                }
            }
            Phase::Connected => {
                st.recent_acks.retain(|_, expiry| *expiry > now);
                self.retransmit_due(st, now);
                if now.saturating_duration_since(st.last_send) >= timeouts.connection_retry_interval
                {
                    st.stats.heartbeats_sent += 1;
                    let heartbeat = Header::new(st.session_id, Flags::HBT);
                    self.send_control(st, heartbeat, now);
                }
            }
            Phase::Disconnected(_) => {}
        }
    }

    fn retransmit_due(&self, st: &mut SessionState, now: Instant) {
        let interval = self.params.timeouts.imp_retry_interval;
        let mut pending = std::mem::take(&mut st.pending_retransmits);
        for (id32, entry) in pending.iter_mut() {
            if entry.next_resend > now {
                continue;
            }
            trace!(session = st.session_id, id32 = *id32, "Retransmitting");
            self.transmit(st, &mut entry.packet, now);
            entry.next_resend = now + interval;
            st.stats.retransmissions += 1;
        }
        st.pending_retransmits = pending;
    }

    /// Enter Disconnected: resolve every outstanding request to no answer
    /// and drop all queues and retry tables
    fn force_disconnect(&self, st: &mut SessionState, reason: DisconnectReason, effects: &mut Effects) {
        if st.is_disconnected() {
            return;
        }
        st.phase = Phase::Disconnected(reason);
        effects
            .resolved
            .extend(st.outstanding.drain().map(|(_, slot)| (slot, None)));
        effects.discarded.extend(st.delivered.drain(..));
        st.pending_retransmits.clear();
        st.recent_acks.clear();
        st.owed.clear();
        info!(session = st.session_id, peer = %st.peer_addr, reason = %reason, "Connection closed");
    }

    /// Send FIN if a session exists and enter Disconnected
    pub(crate) fn close(&self, reason: DisconnectReason) {
        let mut effects = Effects::default();
        {
            let mut st = self.state.lock();
            if st.is_disconnected() {
                return;
            }
            if matches!(st.phase, Phase::Connected | Phase::Pending { .. }) {
                let fin = Header::new(st.session_id, Flags::FIN);
                self.send_control(&mut st, fin, Instant::now());
            }
            self.force_disconnect(&mut st, reason, &mut effects);
        }
        self.cond.notify_all();
        effects.apply();
    }

    // ── application operations ──────────────────────────────────────────

    fn send_data(&self, data: &[u8], reliable: bool) -> Result<()> {
        self.check_size(data.len())?;
        let mut st = self.state.lock();
        st.ensure_connected()?;
        let now = Instant::now();
        let payload = Bytes::copy_from_slice(data);
        if reliable {
            self.send_reliable(&mut st, Flags::DATA, 0, payload, now);
        } else {
            let mut packet = Packet::new(Header::new(st.session_id, Flags::DATA), payload);
            self.transmit(&mut st, &mut packet, now);
        }
        Ok(())
    }

    fn send_request(&self, data: &[u8]) -> Result<RequestHandle> {
        self.check_size(data.len())?;
        let mut st = self.state.lock();
        st.ensure_connected()?;
        let id64 = st.next_request_id();
        let slot = ResponseSlot::new();
        st.outstanding.insert(id64, slot.clone());
        let payload = Bytes::copy_from_slice(data);
        self.send_reliable(&mut st, Flags::REQ | Flags::DATA, id64, payload, Instant::now());
        Ok(RequestHandle::new(id64, slot, self.self_ref.clone()))
    }

    pub(crate) fn respond(&self, id64: CorrelationId, data: &[u8]) -> Result<bool> {
        self.check_size(data.len())?;
        let mut st = self.state.lock();
        if !st.owed.remove(&id64) {
            return Ok(false);
        }
        let payload = Bytes::copy_from_slice(data);
        self.send_reliable(&mut st, Flags::DATA | Flags::ACK, id64, payload, Instant::now());
        Ok(true)
    }

    pub(crate) fn reject(&self, id64: CorrelationId) -> bool {
        let mut st = self.state.lock();
        if !st.owed.remove(&id64) {
            return false;
        }
        self.send_reliable(&mut st, Flags::ACK | Flags::CXL, id64, Bytes::new(), Instant::now());
        true
    }

    pub(crate) fn converse(&self, id64: CorrelationId, data: &[u8]) -> Result<Option<RequestHandle>> {
        self.check_size(CONVERSATION_PREFIX_SIZE + data.len())?;
        let mut st = self.state.lock();
        if !st.owed.remove(&id64) {
            return Ok(None);
        }
        let next = st.next_request_id();
        let slot = ResponseSlot::new();
        st.outstanding.insert(next, slot.clone());
        let payload = encode_conversation(next, data);
        self.send_reliable(
            &mut st,
            Flags::DATA | Flags::ACK | Flags::REQ,
            id64,
            payload,
            Instant::now(),
        );
        Ok(Some(RequestHandle::new(next, slot, self.self_ref.clone())))
    }

    pub(crate) fn cancel_request(&self, id64: CorrelationId) -> bool {
        let slot = {
            let mut st = self.state.lock();
            let Some(slot) = st.outstanding.remove(&id64) else {
                return false;
            };
            if matches!(st.phase, Phase::Connected) {
                self.send_reliable(&mut st, Flags::CXL, id64, Bytes::new(), Instant::now());
            }
            slot
        };
        drop(slot.resolve(None));
        true
    }

    fn wait_until<F>(&self, timeout: Option<Duration>, mut done: F) -> bool
    where
        F: FnMut(&SessionState) -> Option<bool>,
    {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut st = self.state.lock();
        loop {
            if let Some(result) = done(&*st) {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut st, deadline).timed_out() {
                        return done(&*st).unwrap_or(false);
                    }
                }
                None => self.cond.wait(&mut st),
            }
        }
    }
}

/// Application handle to one LiteConn session.
///
/// Created by [`ConnectionManager::connect_peer`] or
/// [`ConnectionManager::accept`]. Dropping it disconnects the session. The
/// connection sends through its manager's socket; after the manager is
/// dropped the connection is `Disconnected` and sends fail with
/// [`ConnectionError::Closed`].
///
/// [`ConnectionManager::connect_peer`]: crate::manager::ConnectionManager::connect_peer
/// [`ConnectionManager::accept`]: crate::manager::ConnectionManager::accept
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// Send `data` once, without acknowledgement
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        self.shared.send_data(data, false)
    }

    /// Send `data` and retransmit until the peer acknowledges it
    pub fn send_reliable_data(&self, data: &[u8]) -> Result<()> {
        self.shared.send_data(data, true)
    }

    /// Send a request; the returned handle resolves to the peer's reply
    pub fn send_request(&self, data: &[u8]) -> Result<RequestHandle> {
        self.shared.send_request(data)
    }

    /// Pop the oldest delivered message without blocking
    pub fn receive(&self) -> Option<Message> {
        self.shared.state.lock().delivered.pop_front()
    }

    /// Answer request `id64`; `Ok(false)` if nothing is owed for it
    pub fn respond(&self, id64: CorrelationId, data: &[u8]) -> Result<bool> {
        self.shared.respond(id64, data)
    }

    /// Reject request `id64`; `false` if nothing is owed for it
    pub fn reject(&self, id64: CorrelationId) -> bool {
        self.shared.reject(id64)
    }

    /// Answer request `id64` and attach a follow-up request
    pub fn converse(&self, id64: CorrelationId, data: &[u8]) -> Result<Option<RequestHandle>> {
        self.shared.converse(id64, data)
    }

    /// Send FIN and disconnect without waiting for the peer
    pub fn disconnect(&self) {
        self.shared.close(DisconnectReason::Local);
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().phase.status()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self.shared.state.lock().phase {
            Phase::Disconnected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Block until the handshake completes.
    ///
    /// Returns `false` on timeout or if the connection ended first.
    pub fn wait_for_connection_complete(&self, timeout: Option<Duration>) -> bool {
        self.shared.wait_until(timeout, |st| match st.phase {
            Phase::Connected => Some(true),
            Phase::Disconnected(_) => Some(false),
            _ => None,
        })
    }

    /// Block until a message is available to [`receive`](Self::receive).
    ///
    /// Returns `false` on timeout or if the connection ended first.
    pub fn wait_for_data_packet(&self, timeout: Option<Duration>) -> bool {
        self.shared.wait_until(timeout, |st| {
            if !st.delivered.is_empty() {
                Some(true)
            } else if st.is_disconnected() {
                Some(false)
            } else {
                None
            }
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.state.lock().peer_addr
    }

    /// Negotiated session id, 0 until the client handshake completes
    pub fn session_id(&self) -> SessionId {
        self.shared.state.lock().session_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.state.lock().stats
    }

    /// Messages delivered and not yet received
    pub fn queued_messages(&self) -> usize {
        self.shared.state.lock().delivered.len()
    }

    /// Reliable datagrams still awaiting acknowledgement
    pub fn pending_reliable(&self) -> usize {
        self.shared.state.lock().pending_retransmits.len()
    }

    /// Requests sent and not yet resolved
    pub fn outstanding_requests(&self) -> usize {
        self.shared.state.lock().outstanding.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close(DisconnectReason::Local);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Connection")
            .field("session_id", &st.session_id)
            .field("peer_addr", &st.peer_addr)
            .field("status", &st.phase.status())
            .finish()
    }
}
