//! Request/response ping-pong over UDP using LiteConn

use liteconn::{Connection, ConnectionManager, ManagerConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <server|client> [address] [count]", args[0]);
        eprintln!("Example: {} server 127.0.0.1:12345", args[0]);
        eprintln!("Example: {} client 127.0.0.1:12345 10", args[0]);
        return Ok(());
    }

    let mode = &args[1];
    let addr: SocketAddr = if args.len() > 2 {
        args[2].parse()?
    } else {
        "127.0.0.1:12345".parse()?
    };
    let count: usize = if args.len() > 3 { args[3].parse()? } else { 5 };

    match mode.as_str() {
        "server" => run_server(addr),
        "client" => run_client(addr, count),
        _ => {
            eprintln!("Mode must be 'server' or 'client'");
            Ok(())
        }
    }
}

fn run_server(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::bind(addr, ManagerConfig::server())?;
    info!("Server listening on {}", manager.local_addr());

    loop {
        match manager.accept(None, Some(Duration::from_secs(5))) {
            Ok(conn) => {
                info!("New connection from {}", conn.peer_addr());
                std::thread::spawn(move || serve(conn));
            }
            Err(e) if e.is_recoverable() || e.is_connection_error() => {
                warn!("Accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("Listener stopped: {}", e);
                return Err(e.into());
            }
        }
    }
}

/// Answer every request with "pong" until the peer goes away
fn serve(conn: Connection) {
    let peer = conn.peer_addr();
    while !conn.is_disconnected() {
        if !conn.wait_for_data_packet(Some(Duration::from_secs(1))) {
            continue;
        }
        while let Some(message) = conn.receive() {
            let (payload, handle) = message.into_parts();
            let Some(handle) = handle else {
                info!("Datagram from {}: {} bytes", peer, payload.len());
                continue;
            };
            if let Err(e) = handle.respond(b"pong") {
                error!("Reply to {} failed: {}", peer, e);
            }
        }
    }
    info!("Client {} disconnected: {:?}", peer, conn.disconnect_reason());
}

fn run_client(addr: SocketAddr, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::bind("0.0.0.0:0", ManagerConfig::client())?;
    let conn = manager.connect_peer(addr, Some(Duration::from_secs(5)))?;
    info!("Connected to {} (session {:#010x})", addr, conn.session_id());

    for i in 0..count {
        let started = Instant::now();
        let request = conn.send_request(format!("ping {i}").as_bytes())?;
        match request.get_response() {
            Some(reply) => info!(
                "Reply {}: {:?} in {:?}",
                i,
                String::from_utf8_lossy(reply.payload()),
                started.elapsed()
            ),
            None => warn!("Request {} was not answered", i),
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    let stats = conn.stats();
    info!(
        "Done: {} datagrams sent, {} retransmissions",
        stats.datagrams_sent, stats.retransmissions
    );
    conn.disconnect();
    Ok(())
}
