//! # LiteConn - Reliable messaging over unreliable datagrams
//!
//! LiteConn establishes sessions between peers over a plain datagram socket
//! and layers on top of them liveness detection, guaranteed-once delivery of
//! flagged traffic, and a request/response pattern whose replies can carry a
//! follow-up request (a conversation).
//!
//! ## Features
//!
//! - **Session handshake**: SYN / SYN|ACK / ACK with retries from both ends
//! - **Liveness**: heartbeats while idle, timeout after silence, FIN on close
//! - **Reliable delivery**: retransmission until acked, duplicate suppression,
//!   backpressure by withholding acks when the receive queue is full
//! - **Requests and conversations**: correlated replies, rejection,
//!   cancellation, and piggybacked follow-up requests
//! - **Multiplexing**: many connections over one socket, routed by session id
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use liteconn::{ConnectionManager, ManagerConfig};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ConnectionManager::bind("127.0.0.1:7000", ManagerConfig::server())?;
//!     let client = ConnectionManager::bind("127.0.0.1:0", ManagerConfig::client())?;
//!
//!     let outbound = client.connect_peer(server.local_addr(), None)?;
//!     let inbound = server.accept(Some(Duration::from_secs(5)), Some(Duration::from_secs(5)))?;
//!
//!     let reply = outbound.send_request(b"ping")?;
//!     inbound.wait_for_data_packet(Some(Duration::from_secs(1)));
//!     if let Some(mut message) = inbound.receive() {
//!         if let Some(handle) = message.take_request() {
//!             handle.respond(b"pong")?;
//!         }
//!     }
//!     println!("{:?}", reply.get_response().map(|m| m.into_payload()));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  ConnectionManager  │  slots, accept/connect, maintenance thread
//! ├─────────────────────┤
//! │     Connection      │  handshake, heartbeat, IMP retry, requests
//! ├─────────────────────┤
//! │   liteconn-core     │  header, flags, serial arithmetic
//! ├─────────────────────┤
//! │   DatagramSocket    │  UDP or in-memory network
//! └─────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod manager;
pub mod metrics;
pub mod transport;

// Re-exports
pub use config::ManagerConfig;
pub use connection::{Connection, ConnectionStatus, DisconnectReason};
pub use error::{ConnectionError, LiteError, Result};
pub use handle::{Message, RequestHandle, ResponseHandle};
pub use manager::ConnectionManager;
pub use metrics::{ManagerMetrics, MetricsSnapshot};
pub use transport::{DatagramSocket, FaultModel, MemoryNetwork, MemoryTransport, UdpTransport};

pub use liteconn_core::{
    ConnectionStats, CorrelationId, Flags, Header, Packet, SessionId, TimeoutSetting,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
