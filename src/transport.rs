//! Datagram socket abstraction
//!
//! The [`DatagramSocket`] trait is everything a
//! [`ConnectionManager`](crate::manager::ConnectionManager) needs from the
//! network: addressed sends and a non-blocking read returning at most one
//! buffered datagram per call. [`UdpTransport`] backs it with a real UDP
//! socket; [`MemoryNetwork`] provides an in-process network with fault
//! injection for tests, benches and demos.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Unreliable datagram transport shared by every connection of a manager.
///
/// The trait is object-safe so it can be used as `Arc<dyn DatagramSocket>`.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Read one buffered datagram into `buf` without blocking.
    ///
    /// Returns `Ok(None)` when nothing is buffered.
    fn try_read_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Return the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

// ---------------------------------------------------------------------------
// UdpTransport: non-blocking std::net::UdpSocket
// ---------------------------------------------------------------------------

/// [`DatagramSocket`] implementation wrapping a non-blocking `UdpSocket`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a new UDP socket to `addr`.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Self::new(UdpSocket::bind(addr)?)
    }

    /// Wrap an existing `UdpSocket`, switching it to non-blocking mode.
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpTransport {
    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    fn try_read_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ---------------------------------------------------------------------------
// MemoryNetwork: in-process datagram network
// ---------------------------------------------------------------------------

/// Loss and duplication applied to datagrams a [`MemoryTransport`] sends.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultModel {
    /// Probability in `[0, 1]` that a datagram is silently lost
    pub loss_rate: f64,
    /// Probability in `[0, 1]` that a delivered datagram arrives twice
    pub duplicate_rate: f64,
}

impl FaultModel {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
            duplicate_rate: 0.0,
        }
    }

    pub fn duplicating(duplicate_rate: f64) -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: duplicate_rate.clamp(0.0, 1.0),
        }
    }

    /// Number of copies of one datagram that reach the wire
    fn copies(&self) -> usize {
        let mut rng = rand::thread_rng();
        if self.loss_rate > 0.0 && rng.gen_bool(self.loss_rate.min(1.0)) {
            return 0;
        }
        if self.duplicate_rate > 0.0 && rng.gen_bool(self.duplicate_rate.min(1.0)) {
            return 2;
        }
        1
    }
}

const DEFAULT_INBOX_CAPACITY: usize = 1024;
const FIRST_EPHEMERAL_PORT: u16 = 40000;

struct NetworkInner {
    sockets: Mutex<HashMap<SocketAddr, Weak<MemoryTransport>>>,
    next_port: Mutex<u16>,
    inbox_capacity: usize,
}

/// In-process datagram network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose sockets buffer at most `capacity` unread datagrams
    pub fn with_inbox_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                sockets: Mutex::new(HashMap::new()),
                next_port: Mutex::new(FIRST_EPHEMERAL_PORT),
                inbox_capacity: capacity.max(1),
            }),
        }
    }

    /// Bind a socket to `addr`. Port 0 picks a free port on 127.0.0.1.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<Arc<MemoryTransport>> {
        let mut sockets = self.inner.sockets.lock();
        sockets.retain(|_, socket| socket.strong_count() > 0);

        let addr = if addr.port() == 0 {
            let ip = if addr.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                addr.ip()
            };
            let mut next_port = self.inner.next_port.lock();
            let start = *next_port;
            loop {
                let candidate = SocketAddr::new(ip, *next_port);
                *next_port = next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
                if !sockets.contains_key(&candidate) {
                    break candidate;
                }
                if *next_port == start {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "no free port in memory network",
                    ));
                }
            }
        } else if sockets.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        } else {
            addr
        };

        let transport = Arc::new(MemoryTransport {
            addr,
            network: self.inner.clone(),
            inbox: Mutex::new(Inbox {
                queue: VecDeque::new(),
                capacity: self.inner.inbox_capacity,
                blocked: false,
                closed: false,
                faults: FaultModel::default(),
            }),
        });
        sockets.insert(addr, Arc::downgrade(&transport));
        Ok(transport)
    }

    /// Bind to an ephemeral loopback port
    pub fn bind_any(&self) -> io::Result<Arc<MemoryTransport>> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}

impl NetworkInner {
    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<MemoryTransport>> {
        self.sockets.lock().get(addr).and_then(Weak::upgrade)
    }
}

struct Inbox {
    queue: VecDeque<(Bytes, SocketAddr)>,
    capacity: usize,
    blocked: bool,
    closed: bool,
    faults: FaultModel,
}

/// One socket of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<NetworkInner>,
    inbox: Mutex<Inbox>,
}

impl MemoryTransport {
    /// Silently discard everything this socket sends or would receive
    pub fn set_blocked(&self, blocked: bool) {
        self.inbox.lock().blocked = blocked;
    }

    /// Close the socket: sends fail, reads return nothing, inbound is dropped
    pub fn close(&self) {
        let mut inbox = self.inbox.lock();
        inbox.closed = true;
        inbox.queue.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.lock().closed
    }

    /// Apply `faults` to every datagram sent from now on
    pub fn set_faults(&self, faults: FaultModel) {
        self.inbox.lock().faults = faults;
    }

    /// Datagrams buffered and not yet read
    pub fn queued(&self) -> usize {
        self.inbox.lock().queue.len()
    }

    fn deliver(&self, datagram: &Bytes, from: SocketAddr) {
        let mut inbox = self.inbox.lock();
        if inbox.closed || inbox.blocked {
            return;
        }
        if inbox.queue.len() >= inbox.capacity {
            trace!(addr = %self.addr, "Memory inbox full, datagram dropped");
            return;
        }
        inbox.queue.push_back((datagram.clone(), from));
    }
}

impl DatagramSocket for MemoryTransport {
    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let faults = {
            let inbox = self.inbox.lock();
            if inbox.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
            }
            if inbox.blocked {
                return Ok(buf.len());
            }
            inbox.faults
        };

        if let Some(peer) = self.network.lookup(&target) {
            let datagram = Bytes::copy_from_slice(buf);
            for _ in 0..faults.copies() {
                peer.deliver(&datagram, self.addr);
            }
        }
        Ok(buf.len())
    }

    fn try_read_datagram(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return Ok(None);
        }
        match inbox.queue.pop_front() {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network
            .sockets
            .lock()
            .retain(|_, socket| socket.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(socket: &MemoryTransport) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 64];
        socket
            .try_read_datagram(&mut buf)
            .unwrap()
            .map(|(len, from)| (buf[..len].to_vec(), from))
    }

    #[test]
    fn test_memory_delivery() {
        let net = MemoryNetwork::new();
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());

        a.send_datagram(b"hi", b.local_addr().unwrap()).unwrap();
        let (data, from) = read(&b).unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(read(&b).is_none());
    }

    #[test]
    fn test_explicit_port_conflict() {
        let net = MemoryNetwork::new();
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let first = net.bind(addr).unwrap();
        assert_eq!(
            net.bind(addr).err().map(|e| e.kind()),
            Some(io::ErrorKind::AddrInUse)
        );
        drop(first);
        assert!(net.bind(addr).is_ok());
    }

    #[test]
    fn test_closed_and_blocked_sockets() {
        let net = MemoryNetwork::new();
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        let b_addr = b.local_addr().unwrap();

        b.set_blocked(true);
        a.send_datagram(b"lost", b_addr).unwrap();
        assert_eq!(b.queued(), 0);
        b.set_blocked(false);

        b.close();
        assert!(b.send_datagram(b"x", a.local_addr().unwrap()).is_err());
        a.send_datagram(b"dropped", b_addr).unwrap();
        assert!(read(&b).is_none());
    }

    #[test]
    fn test_fault_model_extremes() {
        let net = MemoryNetwork::new();
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        let b_addr = b.local_addr().unwrap();

        a.set_faults(FaultModel::lossy(1.0));
        a.send_datagram(b"gone", b_addr).unwrap();
        assert_eq!(b.queued(), 0);

        a.set_faults(FaultModel::duplicating(1.0));
        a.send_datagram(b"twice", b_addr).unwrap();
        assert_eq!(b.queued(), 2);
    }

    #[test]
    fn test_inbox_is_bounded() {
        let net = MemoryNetwork::with_inbox_capacity(2);
        let a = net.bind_any().unwrap();
        let b = net.bind_any().unwrap();
        for _ in 0..5 {
            a.send_datagram(b"x", b.local_addr().unwrap()).unwrap();
        }
        assert_eq!(b.queued(), 2);
    }

    #[test]
    fn test_udp_nonblocking_read() {
        let socket = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.try_read_datagram(&mut buf).unwrap().is_none());

        let addr = socket.local_addr().unwrap();
        socket.send_datagram(b"loop", addr).unwrap();
        let mut got = None;
        for _ in 0..100 {
            if let Some(r) = socket.try_read_datagram(&mut buf).unwrap() {
                got = Some(r);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (len, from) = got.unwrap();
        assert_eq!(&buf[..len], b"loop");
        assert_eq!(from, addr);
    }
}
