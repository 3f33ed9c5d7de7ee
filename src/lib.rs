//! # Mill-TCP
//! Non-blocking TCP networking on a single-threaded readiness loop, without
//! an async runtime.
//!
//! Mill-TCP wraps BSD sockets in small owned types, buffers their bytes in
//! lazily compacting [`ByteBuffer`]s, frames records with [`LineReader`], and
//! dispatches readiness through an [`EventLoop`] built on [`mio`]. A
//! thread-per-connection server is available for handlers that must block.
//! ## Features
//! - **Typed errors**: every errno becomes a [`NetError`]; `WouldBlock` is a value, not a failure
//! - **Edge-triggered loop**: I/O callbacks, timers and cross-thread posting on one thread
//! - **Safe removal**: descriptors removed mid-batch are skipped, never invalidated
//! - **Buffered connections**: input/output buffers with line framing and size limits
//! - **Two serving models**: [`TcpServer`] on the loop, or [`ThreadedTcpServer`] with bounded shutdown
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌─────────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│ HandlerRegistry │───▶│ PollHandle  │
//! └─────────────┘    └─────────────────┘    └─────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────┐                           ┌─────────────┐
//! │ TimerQueue  │                           │ mio (epoll) │
//! └─────────────┘                           └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_tcp::{EventLoop, Interest, TcpListener};
//! use std::time::Duration;
//!
//! fn main() -> mill_tcp::error::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let listener = TcpListener::new(8080)?;
//!
//!     event_loop.add_io(listener.fd(), Interest::READ, move |_, _| {
//!         while let Some(mut conn) = listener.accept() {
//!             let _ = conn.write(b"hello\n");
//!         }
//!     })?;
//!     event_loop.add_timer(Duration::from_secs(60), |lp| lp.stop(), false);
//!
//!     event_loop.run()
//! }
//! ```
//!
//! - [`EventLoop`]: descriptor and timer registration, the dispatch loop
//! - [`net`]: sockets, listener, connection and the event-driven server
//! - [`thread_pool`]: thread-per-connection server and its registry
//! - [`buffer`] and [`line`]: byte accumulation and record framing
//! - [`error`]: the error taxonomy

pub mod buffer;
pub mod error;
pub mod event;
pub mod handler;
pub mod line;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod thread_pool;
pub mod timer;

pub use buffer::ByteBuffer;
pub use error::{NetError, Result};
pub use event::{Interest, Readiness};
pub use handler::EventHandler;
pub use line::{Line, LinePolicy, LineReader};
pub use net::socket::{ConnectStatus, Socket, SocketState};
pub use net::tcp::{
    traits::{ConnectionId, NetworkHandler, Readable, Writable},
    TcpClient, TcpConnection, TcpListener, TcpServer, TcpServerConfig,
};
pub use reactor::{EventLoop, EventLoopConfig, LoopHandle};
pub use thread_pool::{PeerHandler, ThreadRegistry, ThreadedTcpServer};
pub use timer::TimerHandle;

/// Commonly used types and traits.
///
/// ```rust
/// use mill_tcp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::ByteBuffer;
    pub use crate::error::{NetError, Result};
    pub use crate::event::{Interest, Readiness};
    pub use crate::handler::EventHandler;
    pub use crate::line::{Line, LinePolicy, LineReader};
    pub use crate::net::tcp::traits::{ConnectionId, NetworkHandler, Readable, Writable};
    pub use crate::net::tcp::{TcpConnection, TcpListener, TcpServer, TcpServerConfig};
    pub use crate::reactor::{EventLoop, LoopHandle};
    pub use crate::thread_pool::{PeerHandler, ThreadedTcpServer};
}
