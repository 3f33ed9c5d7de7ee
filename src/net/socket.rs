//! Thin wrapper over the BSD socket syscalls.
//!
//! Every failure is translated into [`NetError`] before it leaves this
//! module, and `EINTR` is retried in place.

use std::{
    mem,
    net::{Ipv4Addr, Shutdown, SocketAddrV4},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use crate::error::{NetError, Result};

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

/// Outcome of [`Socket::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    /// Completion is reported later as write readiness.
    InProgress,
}

/// Exclusive owner of one stream socket descriptor.
#[derive(Debug)]
pub struct Socket {
    fd: Option<OwnedFd>,
    state: SocketState,
}

impl Socket {
    /// Creates an IPv4 stream socket, non-blocking from the start when asked.
    pub fn create(nonblocking: bool) -> Result<Socket> {
        let fd = open_stream(nonblocking)?;
        Ok(Socket {
            fd: Some(fd),
            state: SocketState::Unbound,
        })
    }

    /// Adopts an already connected descriptor.
    pub fn from_connected(fd: OwnedFd) -> Socket {
        Socket {
            fd: Some(fd),
            state: SocketState::Connected,
        }
    }

    /// The raw descriptor, or `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    fn raw(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(NetError::Closed)
    }

    pub fn bind(&mut self, addr: Ipv4Addr, port: u16) -> Result<()> {
        let fd = self.raw()?;
        let sin = sockaddr_v4(SocketAddrV4::new(addr, port));
        syscall!(bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map_err(|e| NetError::from_io("bind", e))?;
        self.state = SocketState::Bound;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let fd = self.raw()?;
        syscall!(listen(fd, backlog)).map_err(|e| NetError::from_io("listen", e))?;
        self.state = SocketState::Listening;
        Ok(())
    }

    pub fn connect(&mut self, addr: Ipv4Addr, port: u16) -> Result<ConnectStatus> {
        let fd = self.raw()?;
        let sin = sockaddr_v4(SocketAddrV4::new(addr, port));
        let res = syscall!(connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ));
        match res {
            Ok(_) => {
                self.state = SocketState::Connected;
                Ok(ConnectStatus::Connected)
            }
            // An interrupted connect keeps going asynchronously.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR)) => {
                self.state = SocketState::Connecting;
                Ok(ConnectStatus::InProgress)
            }
            Err(e) => Err(NetError::from_io("connect", e)),
        }
    }

    /// Resolves a pending connect by reading `SO_ERROR`.
    pub fn finish_connect(&mut self) -> Result<()> {
        if self.state != SocketState::Connecting {
            return Ok(());
        }
        let code: libc::c_int = self.getsockopt(libc::SOL_SOCKET, libc::SO_ERROR)?;
        if code != 0 {
            self.state = SocketState::Closed;
            return Err(NetError::from_io(
                "connect",
                std::io::Error::from_raw_os_error(code),
            ));
        }
        match self.peer_addr() {
            Ok(_) => {
                self.state = SocketState::Connected;
                Ok(())
            }
            Err(NetError::System { source, .. })
                if source.raw_os_error() == Some(libc::ENOTCONN) =>
            {
                Err(NetError::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Accepts one pending connection; the new socket is non-blocking.
    pub fn accept(&self) -> Result<(Socket, SocketAddrV4)> {
        let fd = self.raw()?;
        loop {
            // SAFETY: all-zero bytes are a valid sockaddr_storage.
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            match accept_raw(fd, &mut storage, &mut len) {
                Ok(new_fd) => {
                    // SAFETY: accept returned a fresh descriptor nobody else owns.
                    let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
                    let peer = sockaddr_from_storage(&storage)?;
                    return Ok((Socket::from_connected(owned), peer));
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(NetError::from_io("accept", e)),
            }
        }
    }

    /// Returns `Ok(0)` on orderly peer shutdown.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw()?;
        loop {
            let res = syscall!(recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            ));
            match res {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(NetError::from_io("recv", e)),
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.raw()?;
        loop {
            let res = syscall!(send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            ));
            match res {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(NetError::from_io("send", e)),
            }
        }
    }

    pub fn set_reuseaddr(&self, enabled: bool) -> Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, enabled as libc::c_int)
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<()> {
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as libc::c_int)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.raw()?;
        set_nonblocking_raw(fd, nonblocking).map_err(|e| NetError::from_io("fcntl", e))
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let fd = self.raw()?;
        // SAFETY: all-zero bytes are a valid sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))
        .map_err(|e| NetError::from_io("getsockname", e))?;
        sockaddr_from_storage(&storage)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        let fd = self.raw()?;
        // SAFETY: all-zero bytes are a valid sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))
        .map_err(|e| NetError::from_io("getpeername", e))?;
        sockaddr_from_storage(&storage)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        shutdown_raw(self.raw()?, how)
    }

    /// Waits until the socket is readable or `timeout` elapses.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        let fd = self.raw()?;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match syscall!(poll(&mut pfd, 1, millis)) {
            Ok(n) => Ok(n > 0),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(false),
            Err(e) => Err(NetError::from_io("poll", e)),
        }
    }

    /// Closes the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            tracing::trace!(fd = fd.as_raw_fd(), "closing socket");
            drop(fd);
        }
        self.state = SocketState::Closed;
    }

    fn setsockopt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
        let fd = self.raw()?;
        syscall!(setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map_err(|e| NetError::from_io("setsockopt", e))?;
        Ok(())
    }

    fn getsockopt(&self, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int> {
        let fd = self.raw()?;
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))
        .map_err(|e| NetError::from_io("getsockopt", e))?;
        Ok(value)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_stream(nonblocking: bool) -> Result<OwnedFd> {
    let mut ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    if nonblocking {
        ty |= libc::SOCK_NONBLOCK;
    }
    let fd = syscall!(socket(libc::AF_INET, ty, 0)).map_err(|e| NetError::from_io("socket", e))?;
    // SAFETY: socket returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_stream(nonblocking: bool) -> Result<OwnedFd> {
    let fd = syscall!(socket(libc::AF_INET, libc::SOCK_STREAM, 0))
        .map_err(|e| NetError::from_io("socket", e))?;
    // SAFETY: socket returned a fresh descriptor nobody else owns.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
        .map_err(|e| NetError::from_io("fcntl", e))?;
    if nonblocking {
        set_nonblocking_raw(fd, true).map_err(|e| NetError::from_io("fcntl", e))?;
    }
    Ok(owned)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn accept_raw(
    fd: RawFd,
    storage: &mut libc::sockaddr_storage,
    len: &mut libc::socklen_t,
) -> std::io::Result<RawFd> {
    syscall!(accept4(
        fd,
        storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn accept_raw(
    fd: RawFd,
    storage: &mut libc::sockaddr_storage,
    len: &mut libc::socklen_t,
) -> std::io::Result<RawFd> {
    let new_fd = syscall!(accept(
        fd,
        storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        len,
    ))?;
    if let Err(e) = syscall!(fcntl(new_fd, libc::F_SETFD, libc::FD_CLOEXEC))
        .and_then(|_| set_nonblocking_raw(new_fd, true))
    {
        // SAFETY: new_fd is owned here and not yet handed out.
        unsafe { libc::close(new_fd) };
        return Err(e);
    }
    Ok(new_fd)
}

/// `shutdown(2)` on a descriptor owned elsewhere, such as a worker's socket.
pub(crate) fn shutdown_raw(fd: RawFd, how: Shutdown) -> Result<()> {
    let how = match how {
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    match syscall!(shutdown(fd, how)) {
        Ok(_) => Ok(()),
        // Peer already gone.
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
        Err(e) => Err(NetError::from_io("shutdown", e)),
    }
}

fn set_nonblocking_raw(fd: RawFd, nonblocking: bool) -> std::io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags))?;
    Ok(())
}

fn sockaddr_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: all-zero bytes are a valid sockaddr_in.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

fn sockaddr_from_storage(storage: &libc::sockaddr_storage) -> Result<SocketAddrV4> {
    if storage.ss_family as libc::c_int != libc::AF_INET {
        return Err(NetError::from_io(
            "sockaddr",
            std::io::Error::from_raw_os_error(libc::EAFNOSUPPORT),
        ));
    }
    // SAFETY: the family is AF_INET, so the storage holds a sockaddr_in.
    let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
}
