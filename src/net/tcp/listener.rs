use std::{
    net::{Ipv4Addr, SocketAddrV4},
    os::fd::{AsRawFd, RawFd},
};

use crate::{
    error::{NetError, Result},
    net::socket::Socket,
};

use super::connection::TcpConnection;

pub const DEFAULT_BACKLOG: i32 = libc::SOMAXCONN;

/// A bound, listening, non-blocking TCP socket.
///
/// The listener knows nothing about event loops: [`fd`](Self::fd) exposes the
/// descriptor so the owner can drive it from an [`EventLoop`](crate::EventLoop)
/// or from a dedicated accept thread.
#[derive(Debug)]
pub struct TcpListener {
    socket: Socket,
    backlog: i32,
    local_addr: SocketAddrV4,
}

impl TcpListener {
    /// Listens on `0.0.0.0:port`; port `0` lets the kernel choose.
    pub fn new(port: u16) -> Result<Self> {
        Self::bind(Ipv4Addr::UNSPECIFIED, port, DEFAULT_BACKLOG)
    }

    pub fn bind(addr: Ipv4Addr, port: u16, backlog: i32) -> Result<Self> {
        let mut socket = Socket::create(true)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr, port)?;
        socket.listen(backlog)?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, backlog, "listening");
        Ok(Self {
            socket,
            backlog,
            local_addr,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    /// Accepts one pending connection, `None` when nothing is queued.
    ///
    /// Hard accept failures are logged and also reported as `None`; use
    /// [`try_accept`](Self::try_accept) to observe them.
    pub fn accept(&self) -> Option<TcpConnection> {
        match self.try_accept() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(fd = self.fd(), error = %e, "accept failed");
                None
            }
        }
    }

    pub fn try_accept(&self) -> Result<Option<TcpConnection>> {
        match self.socket.accept() {
            Ok((socket, peer)) => {
                tracing::debug!(fd = socket.fd(), %peer, "accepted connection");
                Ok(Some(TcpConnection::from_accepted(socket, peer)))
            }
            Err(NetError::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Blocks up to `timeout` for a pending connection.
    pub(crate) fn wait_pending(&self, timeout: std::time::Duration) -> Result<bool> {
        self.socket.poll_readable(timeout)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}
