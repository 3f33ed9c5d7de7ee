use crate::buffer::ByteBuffer;
use crate::error::{NetError, Result};

use super::connection::TcpConnection;

/// Unique identifier for connections accepted by a server.
///
/// Ids are handed out sequentially and stay constant for the connection's
/// lifetime; they are never reused within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Something bytes can be pulled from without blocking.
pub trait Readable {
    /// `Ok(0)` means the peer closed; [`NetError::WouldBlock`] means retry later.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reads one chunk of at most `max` bytes straight into `buffer`.
    fn read_into(&mut self, buffer: &mut ByteBuffer, max: usize) -> Result<usize> {
        buffer.fill_with(max, |slot| self.read(slot))
    }
}

/// Something bytes can be pushed into without blocking.
pub trait Writable {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Writes from the head of `buffer` until it drains or the sink stalls.
    ///
    /// Returns the number of bytes consumed from `buffer`. Stalling after some
    /// progress is not an error; stalling before any is [`NetError::WouldBlock`].
    fn write_from(&mut self, buffer: &mut ByteBuffer) -> Result<usize> {
        let mut total = 0;
        while !buffer.is_empty() {
            match self.write(buffer.data()) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.consume(n)?;
                    total += n;
                }
                Err(NetError::WouldBlock) if total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Protocol callbacks driven by [`TcpServer`](super::TcpServer).
///
/// All methods run on the event loop thread and must not block. Incoming
/// bytes are already sitting in the connection's input buffer when
/// [`on_data`](Self::on_data) runs; replies are queued on its output buffer
/// and flushed by the server afterwards.
///
/// Returning an error from `on_connect` or `on_data` closes the connection.
pub trait NetworkHandler: 'static {
    fn on_connect(&self, conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()> {
        let _ = (conn_id, conn);
        Ok(())
    }

    fn on_data(&self, conn_id: ConnectionId, conn: &mut TcpConnection) -> Result<()>;

    /// `graceful` is true when the peer closed the stream or the handler
    /// asked for the close.
    fn on_disconnect(&self, conn_id: ConnectionId, graceful: bool) {
        let _ = (conn_id, graceful);
    }

    fn on_error(&self, conn_id: Option<ConnectionId>, error: &NetError) {
        tracing::warn!(conn_id = conn_id.map(|id| id.as_u64()), %error, "connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunked {
        chunks: Vec<Vec<u8>>,
    }

    impl Readable for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.chunks.is_empty() {
                return Err(NetError::WouldBlock);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    struct Throttled {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Writable for Throttled {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            if self.budget == 0 {
                return Err(NetError::WouldBlock);
            }
            let n = buf.len().min(self.budget).min(3);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_into_appends() {
        let mut source = Chunked {
            chunks: vec![b"he".to_vec(), b"llo".to_vec()],
        };
        let mut buffer = ByteBuffer::new();
        assert_eq!(source.read_into(&mut buffer, 64).unwrap(), 2);
        assert_eq!(source.read_into(&mut buffer, 64).unwrap(), 3);
        assert!(source.read_into(&mut buffer, 64).unwrap_err().is_would_block());
        assert_eq!(buffer.data(), b"hello");
    }

    #[test]
    fn test_write_from_stops_on_stall() {
        let mut sink = Throttled {
            accepted: Vec::new(),
            budget: 7,
        };
        let mut buffer = ByteBuffer::from(&b"0123456789"[..]);
        assert_eq!(sink.write_from(&mut buffer).unwrap(), 7);
        assert_eq!(sink.accepted, b"0123456");
        assert_eq!(buffer.data(), b"789");

        assert!(sink.write_from(&mut buffer).unwrap_err().is_would_block());
    }
}
