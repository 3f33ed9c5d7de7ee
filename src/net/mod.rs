//! Sockets and TCP building blocks.
//!
//! The layers stack from raw descriptors up to servers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────────┐        ┌──────────────────┐           │
//! │  │ TcpServer /      │───────▶│ NetworkHandler / │           │
//! │  │ ThreadedTcpServer│        │ PeerHandler      │           │
//! │  └──────────────────┘        └──────────────────┘           │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ accept               │ read / write / lines
//!              ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   TcpListener            TcpConnection (ByteBuffer in/out)  │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ syscalls, errno ──▶ NetError
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Socket                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Neither the listener nor the connection knows which concurrency model
//! drives it: both expose their descriptor, and the same listener can be
//! registered with an [`EventLoop`](crate::EventLoop) or served from an
//! accept thread by [`ThreadedTcpServer`](crate::thread_pool::ThreadedTcpServer).
//!
//! # Example
//!
//! ```rust,no_run
//! use mill_tcp::net::tcp::TcpListener;
//!
//! # fn main() -> mill_tcp::error::Result<()> {
//! let listener = TcpListener::new(0)?;
//! assert!(listener.local_port() > 0);
//! // Nothing queued yet: accept does not block.
//! assert!(listener.accept().is_none());
//! # Ok(())
//! # }
//! ```

pub mod socket;
pub mod tcp;
