//! TCP listener, connection and event-driven server/client.
//!
//! [`TcpListener`] and [`TcpConnection`] are plain non-blocking sockets and
//! know nothing about the event loop. [`TcpServer`] and [`TcpClient`] glue
//! them to an [`EventLoop`] and drive a [`NetworkHandler`].
//!
//! ```text
//! Connection table (loop thread only):
//!   HashMap<ConnectionId, Tracked>
//!        │
//!        ├──> ConnectionId(1) ──> { fd, Rc<RefCell<TcpConnection>> }
//!        └──> ConnectionId(N) ──> { fd, Rc<RefCell<TcpConnection>> }
//! ```
//!
//! ## Event Handling Pipeline
//!
//! ```text
//! 1. Listener readable ──> TcpListenerHandler::handle_event()
//!        - accept() until WouldBlock
//!        - enforce max_connections, apply TCP_NODELAY and buffer limits
//!        - handler.on_connect(), flush any greeting
//!        - register TcpConnectionHandler for READ
//!
//! 2. Connection readable ──> TcpConnectionHandler::handle_event()
//!        - fill_input() until WouldBlock
//!        - handler.on_data() with the bytes in the input buffer
//!        - flush(); arm WRITE only while output is pending
//!
//!    Connection writable ──> flush() the output buffer
//!
//! 3. EOF, hard error or close_when_flushed() drained:
//!        - remove_io(), close the socket
//!        - handler.on_disconnect()
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use mill_tcp::net::tcp::config::TcpServerConfig;
//! use mill_tcp::line::LinePolicy;
//!
//! let config = TcpServerConfig::builder()
//!     .port(8080)
//!     .max_connections(1000)
//!     .max_line_length(4096)
//!     .line_policy(LinePolicy::Split)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_connections, Some(1000));
//! ```
//!
//! ## Handler Implementation
//!
//! ```rust,no_run
//! use mill_tcp::net::tcp::{
//!     config::TcpServerConfig,
//!     traits::{ConnectionId, NetworkHandler},
//!     TcpConnection, TcpServer,
//! };
//! use mill_tcp::{error::Result, EventLoop};
//!
//! struct LineEcho;
//!
//! impl NetworkHandler for LineEcho {
//!     fn on_data(&self, _id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
//!         while let Some(line) = conn.read_line()? {
//!             conn.queue(line.as_bytes());
//!             conn.queue(b"\n");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let event_loop = EventLoop::new()?;
//! let server = TcpServer::new(TcpServerConfig::builder().port(7000).build()?, LineEcho)?;
//! server.start(&event_loop)?;
//! event_loop.run()
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod listener;
pub mod traits;

pub use config::{TcpServerConfig, TcpServerConfigBuilder};
pub use connection::TcpConnection;
pub use listener::TcpListener;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::{Ipv4Addr, SocketAddrV4},
    os::fd::RawFd,
    rc::Rc,
};

use crate::{
    error::{NetError, Result},
    event::{Interest, Readiness},
    handler::EventHandler,
    reactor::EventLoop,
};
use traits::{ConnectionId, NetworkHandler};

enum Outcome {
    Keep,
    Close,
}

/// Reads what the kernel has, hands it to `handler`, then settles output.
///
/// Input is read in rounds of at most `max_input` bytes, with `on_data`
/// after each round, until the socket would block. The cap only fails the
/// connection when a full buffer survives `on_data` untouched.
fn pump<H: NetworkHandler>(
    handler: &H,
    event_loop: &EventLoop,
    conn_id: ConnectionId,
    fd: RawFd,
    conn: &mut TcpConnection,
    ready: Readiness,
) -> Result<Outcome> {
    let mut eof = false;
    if ready.is_readable() {
        loop {
            match conn.fill_input() {
                Ok(_) => {}
                Err(NetError::WouldBlock | NetError::GracefulClose) => break,
                Err(e) => return Err(e),
            }
            let pending = conn.input().size();
            handler.on_data(conn_id, conn)?;
            if conn.is_input_full() && conn.input().size() >= pending {
                return Err(NetError::BufferOverflow {
                    limit: conn.max_input(),
                });
            }
            if conn.closed_gracefully() || conn.is_closed() || conn.should_close() {
                break;
            }
        }
        eof = conn.closed_gracefully();
    }
    settle(event_loop, fd, conn, eof)
}

/// Flushes pending output and arms write interest only while some remains.
fn settle(
    event_loop: &EventLoop,
    fd: RawFd,
    conn: &mut TcpConnection,
    eof: bool,
) -> Result<Outcome> {
    if conn.has_pending_output() {
        conn.flush()?;
    }
    if eof || conn.should_close() {
        return Ok(Outcome::Close);
    }
    let wanted = if conn.has_pending_output() {
        Interest::READ_WRITE
    } else {
        Interest::READ
    };
    // Not yet registered: the owner arms it when it registers.
    match event_loop.interest_of(fd) {
        Some(current) if current != wanted => event_loop.modify_io(fd, wanted)?,
        _ => {}
    }
    Ok(Outcome::Keep)
}

struct Tracked {
    fd: RawFd,
    conn: Rc<RefCell<TcpConnection>>,
}

struct ServerState<H: NetworkHandler> {
    handler: H,
    config: TcpServerConfig,
    connections: RefCell<HashMap<ConnectionId, Tracked>>,
    next_conn_id: Cell<u64>,
}

impl<H: NetworkHandler> ServerState<H> {
    fn admit(self: &Rc<Self>, event_loop: &EventLoop, mut conn: TcpConnection) {
        let peer = conn.peer_addr();
        if let Some(max) = self.config.max_connections {
            if self.connections.borrow().len() >= max {
                tracing::warn!(%peer, max, "connection limit reached, rejecting");
                return;
            }
        }

        if self.config.no_delay {
            if let Err(e) = conn.set_nodelay(true) {
                tracing::warn!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
        }
        conn.configure(
            self.config.read_chunk,
            self.config.max_input,
            self.config.line_reader(),
        );
        conn.set_pack_threshold(self.config.pack_threshold);

        let conn_id = ConnectionId::new(self.next_conn_id.get());
        self.next_conn_id.set(conn_id.as_u64() + 1);
        let fd = conn.fd();

        if let Err(e) = self.handler.on_connect(conn_id, &mut conn) {
            self.handler.on_error(Some(conn_id), &e);
            conn.close();
            self.handler.on_disconnect(conn_id, false);
            return;
        }
        // A greeting queued by on_connect goes out right away.
        if conn.has_pending_output() {
            if let Err(e) = conn.flush() {
                self.handler.on_error(Some(conn_id), &e);
                self.handler.on_disconnect(conn_id, false);
                return;
            }
        }
        if conn.should_close() {
            conn.close();
            self.handler.on_disconnect(conn_id, true);
            return;
        }

        let interest = if conn.has_pending_output() {
            Interest::READ_WRITE
        } else {
            Interest::READ
        };
        let conn = Rc::new(RefCell::new(conn));
        let conn_handler = TcpConnectionHandler {
            conn_id,
            fd,
            conn: Rc::clone(&conn),
            state: Rc::clone(self),
        };
        if let Err(e) = event_loop.add_handler(fd, interest, conn_handler) {
            tracing::error!(%peer, error = %e, "failed to register connection");
            self.handler.on_error(Some(conn_id), &e);
            self.handler.on_disconnect(conn_id, false);
            return;
        }
        self.connections
            .borrow_mut()
            .insert(conn_id, Tracked { fd, conn });
        tracing::debug!(conn_id = conn_id.as_u64(), %peer, fd, "connection registered");
    }

    fn disconnect(&self, event_loop: &EventLoop, conn_id: ConnectionId, graceful: bool) {
        let Some(tracked) = self.connections.borrow_mut().remove(&conn_id) else {
            return;
        };
        if let Err(e) = event_loop.remove_io(tracked.fd) {
            tracing::warn!(fd = tracked.fd, error = %e, "failed to deregister connection");
        }
        if let Ok(mut conn) = tracked.conn.try_borrow_mut() {
            tracing::debug!(
                conn_id = conn_id.as_u64(),
                peer = %conn.peer_addr(),
                graceful,
                bytes_read = conn.bytes_read(),
                bytes_written = conn.bytes_written(),
                "connection closed"
            );
            conn.close();
        }
        self.handler.on_disconnect(conn_id, graceful);
    }

    fn fail(&self, event_loop: &EventLoop, conn_id: ConnectionId, error: &NetError) {
        self.handler.on_error(Some(conn_id), error);
        self.disconnect(event_loop, conn_id, false);
    }
}

/// Event-driven TCP server on a single [`EventLoop`].
///
/// All callbacks run on the loop thread; the server itself is `!Send` and
/// must be created and used on that thread.
pub struct TcpServer<H: NetworkHandler> {
    listener: Rc<TcpListener>,
    state: Rc<ServerState<H>>,
}

impl<H: NetworkHandler> TcpServer<H> {
    /// Binds the listener right away; bind failures are reported here.
    pub fn new(config: TcpServerConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.address, config.port, config.backlog)?;
        Ok(Self {
            listener: Rc::new(listener),
            state: Rc::new(ServerState {
                handler,
                config,
                connections: RefCell::new(HashMap::new()),
                next_conn_id: Cell::new(1),
            }),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.state.config
    }

    pub fn handler(&self) -> &H {
        &self.state.handler
    }

    /// Registers the listener for read readiness.
    pub fn start(&self, event_loop: &EventLoop) -> Result<()> {
        let listener_handler = TcpListenerHandler {
            listener: Rc::clone(&self.listener),
            state: Rc::clone(&self.state),
        };
        event_loop.add_handler(self.listener.fd(), Interest::READ, listener_handler)
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self, event_loop: &EventLoop) -> Result<()> {
        event_loop.remove_io(self.listener.fd())?;
        let ids: Vec<ConnectionId> = self.state.connections.borrow().keys().copied().collect();
        for conn_id in ids {
            self.state.disconnect(event_loop, conn_id, true);
        }
        tracing::info!(port = self.local_port(), "server shut down");
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    /// Queues `data` for one connection and flushes what the kernel takes.
    ///
    /// Inside that connection's own [`NetworkHandler::on_data`], queue on the
    /// `&mut TcpConnection` instead; the connection is busy and this fails
    /// with [`NetError::WouldBlock`].
    pub fn send_to(&self, event_loop: &EventLoop, conn_id: ConnectionId, data: &[u8]) -> Result<()> {
        let (fd, conn) = {
            let connections = self.state.connections.borrow();
            let tracked = connections.get(&conn_id).ok_or(NetError::Closed)?;
            (tracked.fd, Rc::clone(&tracked.conn))
        };
        let outcome = {
            let mut conn = conn.try_borrow_mut().map_err(|_| NetError::WouldBlock)?;
            conn.queue(data);
            settle(event_loop, fd, &mut conn, false)
        };
        match outcome {
            Ok(Outcome::Keep) => Ok(()),
            Ok(Outcome::Close) => {
                self.state.disconnect(event_loop, conn_id, true);
                Ok(())
            }
            Err(e) => {
                self.state.fail(event_loop, conn_id, &e);
                Err(e)
            }
        }
    }

    /// Sends `data` to every connection. Returns how many accepted it.
    pub fn broadcast(&self, event_loop: &EventLoop, data: &[u8]) -> usize {
        let ids: Vec<ConnectionId> = self.state.connections.borrow().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.send_to(event_loop, *id, data).is_ok())
            .count()
    }

    /// Closes a connection once its queued output has drained.
    pub fn close_connection(&self, event_loop: &EventLoop, conn_id: ConnectionId) -> Result<()> {
        let (fd, conn) = {
            let connections = self.state.connections.borrow();
            let tracked = connections.get(&conn_id).ok_or(NetError::Closed)?;
            (tracked.fd, Rc::clone(&tracked.conn))
        };
        let outcome = {
            let mut conn = conn.try_borrow_mut().map_err(|_| NetError::WouldBlock)?;
            conn.close_when_flushed();
            settle(event_loop, fd, &mut conn, false)
        };
        match outcome {
            Ok(Outcome::Keep) => Ok(()),
            Ok(Outcome::Close) => {
                self.state.disconnect(event_loop, conn_id, true);
                Ok(())
            }
            Err(e) => {
                self.state.fail(event_loop, conn_id, &e);
                Ok(())
            }
        }
    }
}

/// Accepts pending connections when the listener turns readable.
struct TcpListenerHandler<H: NetworkHandler> {
    listener: Rc<TcpListener>,
    state: Rc<ServerState<H>>,
}

impl<H: NetworkHandler> EventHandler for TcpListenerHandler<H> {
    fn handle_event(&mut self, event_loop: &EventLoop, ready: Readiness) {
        if !ready.is_readable() {
            return;
        }
        loop {
            match self.listener.try_accept() {
                Ok(Some(conn)) => self.state.admit(event_loop, conn),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(fd = self.listener.fd(), error = %e, "accept failed");
                    self.state.handler.on_error(None, &e);
                    break;
                }
            }
        }
    }
}

/// Drives one accepted connection.
struct TcpConnectionHandler<H: NetworkHandler> {
    conn_id: ConnectionId,
    fd: RawFd,
    conn: Rc<RefCell<TcpConnection>>,
    state: Rc<ServerState<H>>,
}

impl<H: NetworkHandler> EventHandler for TcpConnectionHandler<H> {
    fn handle_event(&mut self, event_loop: &EventLoop, ready: Readiness) {
        let outcome = match self.conn.try_borrow_mut() {
            Ok(mut conn) => pump(
                &self.state.handler,
                event_loop,
                self.conn_id,
                self.fd,
                &mut conn,
                ready,
            ),
            Err(_) => return,
        };
        match outcome {
            Ok(Outcome::Keep) => {}
            Ok(Outcome::Close) => self.state.disconnect(event_loop, self.conn_id, true),
            Err(e) => self.state.fail(event_loop, self.conn_id, &e),
        }
    }
}

struct ClientState<H: NetworkHandler> {
    handler: H,
    conn_id: ConnectionId,
    fd: RawFd,
    conn: RefCell<TcpConnection>,
    open: Cell<bool>,
}

impl<H: NetworkHandler> ClientState<H> {
    fn drive(&self, event_loop: &EventLoop, conn: &mut TcpConnection, ready: Readiness) -> Result<Outcome> {
        if conn.is_connecting() {
            if !ready.is_writable() {
                return Ok(Outcome::Keep);
            }
            match conn.finish_connect() {
                Ok(()) => {}
                Err(NetError::WouldBlock) => return Ok(Outcome::Keep),
                Err(e) => return Err(e),
            }
            self.handler.on_connect(self.conn_id, conn)?;
            return settle(event_loop, self.fd, conn, false);
        }
        pump(&self.handler, event_loop, self.conn_id, self.fd, conn, ready)
    }

    fn disconnect(&self, event_loop: &EventLoop, graceful: bool) {
        if !self.open.replace(false) {
            return;
        }
        if let Err(e) = event_loop.remove_io(self.fd) {
            tracing::warn!(fd = self.fd, error = %e, "failed to deregister client");
        }
        if let Ok(mut conn) = self.conn.try_borrow_mut() {
            conn.close();
        }
        tracing::debug!(fd = self.fd, graceful, "client disconnected");
        self.handler.on_disconnect(self.conn_id, graceful);
    }

    fn conclude(&self, event_loop: &EventLoop, outcome: Result<Outcome>) {
        match outcome {
            Ok(Outcome::Keep) => {}
            Ok(Outcome::Close) => self.disconnect(event_loop, true),
            Err(e) => {
                self.handler.on_error(Some(self.conn_id), &e);
                self.disconnect(event_loop, false);
            }
        }
    }
}

/// Event-driven TCP client with a non-blocking connect.
///
/// The connect is started by [`connect`](Self::connect) and completes on
/// the loop once the socket turns writable; [`NetworkHandler::on_connect`]
/// runs at that point. Data passed to [`send`](Self::send) before then is
/// queued and flushed after the connect completes.
pub struct TcpClient<H: NetworkHandler> {
    state: Rc<ClientState<H>>,
}

impl<H: NetworkHandler> TcpClient<H> {
    pub fn connect(addr: Ipv4Addr, port: u16, handler: H) -> Result<Self> {
        let (conn, status) = TcpConnection::connect(addr, port)?;
        tracing::debug!(%addr, port, ?status, "connect started");
        Ok(Self {
            state: Rc::new(ClientState {
                handler,
                conn_id: ConnectionId::new(1),
                fd: conn.fd(),
                conn: RefCell::new(conn),
                open: Cell::new(true),
            }),
        })
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.state.conn_id
    }

    pub fn is_connected(&self) -> bool {
        self.state.open.get()
            && self
                .state
                .conn
                .try_borrow()
                .map(|conn| !conn.is_connecting() && !conn.is_closed())
                .unwrap_or(true)
    }

    pub fn is_open(&self) -> bool {
        self.state.open.get()
    }

    pub fn handler(&self) -> &H {
        &self.state.handler
    }

    /// Registers the socket: write interest while connecting, read after.
    pub fn start(&self, event_loop: &EventLoop) -> Result<()> {
        let state = Rc::clone(&self.state);
        let connecting = self.state.conn.borrow().is_connecting();
        if connecting {
            return event_loop.add_io(self.state.fd, Interest::WRITE, move |lp, ready| {
                state.on_ready(lp, ready)
            });
        }

        event_loop.add_io(self.state.fd, Interest::READ, move |lp, ready| {
            state.on_ready(lp, ready)
        })?;
        let outcome = {
            let mut conn = self.state.conn.borrow_mut();
            match self.state.handler.on_connect(self.state.conn_id, &mut conn) {
                Ok(()) => settle(event_loop, self.state.fd, &mut conn, false),
                Err(e) => Err(e),
            }
        };
        self.state.conclude(event_loop, outcome);
        Ok(())
    }

    pub fn send(&self, event_loop: &EventLoop, data: &[u8]) -> Result<()> {
        if !self.state.open.get() {
            return Err(NetError::Closed);
        }
        let outcome = {
            let mut conn = self
                .state
                .conn
                .try_borrow_mut()
                .map_err(|_| NetError::WouldBlock)?;
            conn.queue(data);
            if conn.is_connecting() {
                return Ok(());
            }
            settle(event_loop, self.state.fd, &mut conn, false)
        };
        self.state.conclude(event_loop, outcome);
        Ok(())
    }

    pub fn disconnect(&self, event_loop: &EventLoop) {
        self.state.disconnect(event_loop, true);
    }
}

impl<H: NetworkHandler> ClientState<H> {
    fn on_ready(&self, event_loop: &EventLoop, ready: Readiness) {
        let outcome = match self.conn.try_borrow_mut() {
            Ok(mut conn) => self.drive(event_loop, &mut conn, ready),
            Err(_) => return,
        };
        self.conclude(event_loop, outcome);
    }
}
