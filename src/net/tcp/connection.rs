use std::{
    net::{Ipv4Addr, Shutdown, SocketAddrV4},
    os::fd::{AsRawFd, RawFd},
};

use crate::{
    buffer::ByteBuffer,
    error::{NetError, Result},
    line::{Line, LineReader},
    net::socket::{ConnectStatus, Socket, SocketState},
};

use super::traits::{Readable, Writable};

pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;
pub const DEFAULT_MAX_INPUT: usize = 1024 * 1024;

/// A connected TCP peer.
///
/// The connection owns its socket together with an input and an output
/// [`ByteBuffer`]. Raw [`read`](Self::read)/[`write`](Self::write) bypass the
/// buffers; [`fill_input`](Self::fill_input) and [`flush`](Self::flush) move
/// bytes between the socket and the buffers until the kernel would block.
///
/// The peer address is captured once, at accept time or when a pending
/// connect completes.
#[derive(Debug)]
pub struct TcpConnection {
    socket: Socket,
    peer: SocketAddrV4,
    input: ByteBuffer,
    output: ByteBuffer,
    lines: LineReader,
    read_chunk: usize,
    max_input: usize,
    closed_gracefully: bool,
    close_when_flushed: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl TcpConnection {
    pub(crate) fn from_accepted(socket: Socket, peer: SocketAddrV4) -> Self {
        Self {
            socket,
            peer,
            input: ByteBuffer::new(),
            output: ByteBuffer::new(),
            lines: LineReader::default(),
            read_chunk: DEFAULT_READ_CHUNK,
            max_input: DEFAULT_MAX_INPUT,
            closed_gracefully: false,
            close_when_flushed: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Starts a non-blocking connect.
    ///
    /// With [`ConnectStatus::InProgress`], wait for write readiness and call
    /// [`finish_connect`](Self::finish_connect).
    pub fn connect(addr: Ipv4Addr, port: u16) -> Result<(Self, ConnectStatus)> {
        let mut socket = Socket::create(true)?;
        let status = socket.connect(addr, port)?;
        let peer = match status {
            ConnectStatus::Connected => socket.peer_addr()?,
            ConnectStatus::InProgress => SocketAddrV4::new(addr, port),
        };
        Ok((Self::from_accepted(socket, peer), status))
    }

    pub fn finish_connect(&mut self) -> Result<()> {
        match self.socket.state() {
            SocketState::Connecting => {}
            SocketState::Closed => return Err(NetError::Closed),
            _ => return Ok(()),
        }
        self.socket.finish_connect()?;
        self.peer = self.socket.peer_addr()?;
        tracing::debug!(fd = self.fd(), peer = %self.peer, "connect completed");
        Ok(())
    }

    pub fn is_connecting(&self) -> bool {
        self.socket.state() == SocketState::Connecting
    }

    /// Applies buffering limits: read chunk size, input cap and line framing.
    pub fn configure(&mut self, read_chunk: usize, max_input: usize, lines: LineReader) {
        self.read_chunk = read_chunk.max(1);
        self.max_input = max_input.max(self.read_chunk);
        self.lines = lines;
    }

    pub fn set_pack_threshold(&mut self, threshold: usize) {
        self.input.set_pack_threshold(threshold);
        self.output.set_pack_threshold(threshold);
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<()> {
        self.socket.set_nodelay(enabled)
    }

    /// Switches the descriptor between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn peer_address(&self) -> String {
        self.peer.ip().to_string()
    }

    pub fn peer_port(&self) -> u16 {
        self.peer.port()
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    pub fn closed_gracefully(&self) -> bool {
        self.closed_gracefully
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Raw read. `Ok(0)` marks a graceful close and repeats on every later call.
    ///
    /// An empty `buf` cannot carry that signal and is rejected with
    /// [`NetError::InsufficientData`] without touching the socket.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(NetError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }
        if self.closed_gracefully {
            return Ok(0);
        }
        let res = self.socket.read(buf);
        self.account_read(res)
    }

    /// Raw write.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.socket.write(buf) {
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(n)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn input(&self) -> &ByteBuffer {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut ByteBuffer {
        &mut self.input
    }

    pub fn output(&self) -> &ByteBuffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut ByteBuffer {
        &mut self.output
    }

    /// One `recv` of at most the read chunk into the input buffer.
    ///
    /// On a blocking socket this waits for data. End of stream is
    /// [`NetError::GracefulClose`]; a full input buffer is
    /// [`NetError::BufferOverflow`].
    pub fn read_some(&mut self) -> Result<usize> {
        if self.closed_gracefully {
            return Err(NetError::GracefulClose);
        }
        let room = self.max_input.saturating_sub(self.input.size());
        if room == 0 {
            return Err(NetError::BufferOverflow {
                limit: self.max_input,
            });
        }
        let socket = &self.socket;
        let res = self
            .input
            .fill_with(self.read_chunk.min(room), |slot| socket.read(slot));
        match self.account_read(res)? {
            0 => Err(NetError::GracefulClose),
            n => Ok(n),
        }
    }

    /// Reads until the kernel would block or the input cap is reached,
    /// appending to the input buffer.
    ///
    /// Returns the bytes gained. Stopping at the cap after some progress is
    /// not an error: consume the input and call again. End of stream with
    /// nothing new to report is [`NetError::GracefulClose`]; an input buffer
    /// already at the cap is [`NetError::BufferOverflow`]. Only meaningful on
    /// a non-blocking socket.
    pub fn fill_input(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.read_some() {
                Ok(n) => total += n,
                Err(
                    NetError::WouldBlock
                    | NetError::GracefulClose
                    | NetError::BufferOverflow { .. },
                ) if total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn max_input(&self) -> usize {
        self.max_input
    }

    /// True once unconsumed input has reached the cap.
    pub fn is_input_full(&self) -> bool {
        self.input.size() >= self.max_input
    }

    /// Extracts the next framed line from the input buffer.
    pub fn read_line(&mut self) -> Result<Option<Line>> {
        self.lines.try_extract_line(&mut self.input)
    }

    /// Appends to the output buffer; nothing is sent until [`flush`](Self::flush).
    pub fn queue(&mut self, bytes: &[u8]) {
        self.output.append(bytes);
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Writes queued output until it drains or the kernel would block.
    pub fn flush(&mut self) -> Result<usize> {
        let mut total = 0;
        while !self.output.is_empty() {
            match self.socket.write(self.output.data()) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.consume(n)?;
                    self.bytes_written += n as u64;
                    total += n;
                }
                Err(NetError::WouldBlock) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(total)
    }

    /// Requests a close once all queued output has been flushed.
    pub fn close_when_flushed(&mut self) {
        self.close_when_flushed = true;
    }

    pub fn should_close(&self) -> bool {
        self.close_when_flushed && self.output.is_empty()
    }

    /// Shuts the stream down in both directions and closes the descriptor.
    pub fn close(&mut self) {
        if self.socket.is_closed() {
            return;
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        self.socket.close();
    }

    fn account_read(&mut self, res: Result<usize>) -> Result<usize> {
        match res {
            Ok(0) => {
                if !self.closed_gracefully {
                    tracing::debug!(fd = self.fd(), peer = %self.peer, "peer closed connection");
                }
                self.closed_gracefully = true;
                Ok(0)
            }
            Ok(n) => {
                self.bytes_read += n as u64;
                Ok(n)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // Hard errors move the connection to Closed right away.
    fn fail(&mut self, err: NetError) -> NetError {
        if !err.is_transient() && !matches!(err, NetError::Closed) {
            tracing::debug!(fd = self.fd(), peer = %self.peer, error = %err, "closing after I/O error");
            self.socket.close();
        }
        err
    }
}

impl Readable for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        TcpConnection::read(self, buf)
    }
}

impl Writable for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        TcpConnection::write(self, buf)
    }
}

impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
