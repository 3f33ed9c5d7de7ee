//! Line echo server on the event loop.
//!
//! ```text
//! RUST_LOG=debug cargo run --example line_echo_server -- 7000
//! printf 'hello\nquit\n' | nc 127.0.0.1 7000
//! ```

use std::{
    cell::Cell,
    net::Ipv4Addr,
    rc::Rc,
    time::Duration,
};

use anyhow::Context;
use mill_tcp::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct LineEcho {
    lines: Cell<u64>,
}

struct SharedLineEcho(Rc<LineEcho>);

impl NetworkHandler for SharedLineEcho {
    fn on_connect(&self, conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
        tracing::info!(conn = conn_id.as_u64(), peer = %conn.peer_addr(), "client connected");
        conn.queue(b"welcome, send `quit` to leave\n");
        Ok(())
    }

    fn on_data(&self, _conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
        while let Some(line) = conn.read_line()? {
            self.0.lines.set(self.0.lines.get() + 1);
            if line.as_bytes() == b"quit" {
                conn.queue(b"bye\n");
                conn.close_when_flushed();
                break;
            }
            conn.queue(line.as_bytes());
            conn.queue(b"\n");
        }
        Ok(())
    }

    fn on_disconnect(&self, conn_id: ConnectionId, graceful: bool) {
        tracing::info!(conn = conn_id.as_u64(), graceful, "client disconnected");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("port must be a number")?,
        None => 7000,
    };

    let config = TcpServerConfig::builder()
        .address(Ipv4Addr::LOCALHOST)
        .port(port)
        .max_connections(256)
        .line_policy(LinePolicy::Split)
        .build()?;

    let event_loop = EventLoop::new()?;
    let stats = Rc::new(LineEcho::default());
    let server = Rc::new(TcpServer::new(config, SharedLineEcho(Rc::clone(&stats)))?);
    server.start(&event_loop)?;
    tracing::info!(addr = %server.local_addr(), "listening");

    let s = Rc::clone(&server);
    event_loop.add_timer(
        Duration::from_secs(10),
        move |_| {
            tracing::info!(
                connections = s.connection_count(),
                lines = stats.lines.get(),
                "stats"
            );
        },
        true,
    );

    event_loop.run()?;
    server.shutdown(&event_loop)?;
    Ok(())
}
