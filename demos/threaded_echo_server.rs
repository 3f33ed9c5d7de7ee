//! Thread-per-connection echo server.
//!
//! Serves for the number of seconds given as the second argument, then
//! shuts down and waits for workers to leave.
//!
//! ```text
//! RUST_LOG=info cargo run --example threaded_echo_server -- 7001 30
//! ```

use std::{net::Ipv4Addr, thread, time::Duration};

use anyhow::Context;
use mill_tcp::prelude::*;
use tracing_subscriber::EnvFilter;

struct Echo;

impl PeerHandler for Echo {
    fn serve(&self, conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
        tracing::info!(conn = conn_id.as_u64(), peer = %conn.peer_addr(), "worker started");
        loop {
            conn.read_some()?;
            let pending = conn.input().size();
            let bytes = conn.input_mut().extract_vec(pending)?;
            conn.queue(&bytes);
            conn.flush()?;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let port = match args.next() {
        Some(arg) => arg.parse().context("port must be a number")?,
        None => 7001,
    };
    let serve_for = match args.next() {
        Some(arg) => Duration::from_secs(arg.parse().context("duration must be seconds")?),
        None => Duration::from_secs(30),
    };

    let config = TcpServerConfig::builder()
        .address(Ipv4Addr::LOCALHOST)
        .port(port)
        .max_connections(64)
        .build()?;

    let mut server = ThreadedTcpServer::bind(config, Echo)?;
    server.start()?;
    tracing::info!(port = server.local_port(), "listening");

    thread::sleep(serve_for);
    tracing::info!(workers = server.active_workers(), "shutting down");
    server
        .shutdown(Duration::from_secs(5))
        .context("workers did not exit in time")?;
    Ok(())
}
