//! Shared test helpers for LiteConn integration tests

#![allow(dead_code)]

use liteconn::{Connection, ConnectionManager, ManagerConfig, MemoryNetwork, MemoryTransport};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(3);

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Client and server managers on one memory network, with one connection
/// between them.
pub struct Harness {
    pub net: MemoryNetwork,
    pub server_socket: Arc<MemoryTransport>,
    pub client_socket: Arc<MemoryTransport>,
    // Connections are declared before the managers so they drop first.
    pub client: Connection,
    pub server: Connection,
    pub server_manager: ConnectionManager,
    pub client_manager: ConnectionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::testing())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        Self::build(config, |_, _| {})
    }

    /// Build the pair, letting `prepare` install faults before the handshake
    pub fn build(
        config: ManagerConfig,
        prepare: impl FnOnce(&MemoryTransport, &MemoryTransport),
    ) -> Self {
        let net = MemoryNetwork::new();
        let server_socket = net.bind_any().unwrap();
        let client_socket = net.bind_any().unwrap();
        prepare(&server_socket, &client_socket);

        let server_manager =
            ConnectionManager::with_socket(server_socket.clone(), config.clone().listening(true))
                .unwrap();
        let client_manager =
            ConnectionManager::with_socket(client_socket.clone(), config).unwrap();

        let client = client_manager
            .connect_peer(server_manager.local_addr(), None)
            .unwrap();
        let server = server_manager.accept(Some(WAIT), Some(WAIT)).unwrap();
        assert!(client.wait_for_connection_complete(Some(WAIT)));

        Self {
            net,
            server_socket,
            client_socket,
            client,
            server,
            server_manager,
            client_manager,
        }
    }
}

/// Receive one message, blocking up to `WAIT`
pub fn recv(conn: &Connection) -> liteconn::Message {
    assert!(conn.wait_for_data_packet(Some(WAIT)), "no message arrived");
    conn.receive().unwrap()
}
