use std::{io, os::fd::RawFd, sync::Arc, time::Duration};

use mio::{unix::SourceFd, Events, Poll, Token, Waker};

use crate::{
    error::{NetError, Result},
    event::{Interest, Readiness},
};

/// Token reserved for the cross-thread waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Kernel readiness multiplexer plus its wakeup primitive.
pub struct PollHandle {
    poller: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poller = Poll::new().map_err(|e| NetError::from_io("poll_create", e))?;
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)
            .map_err(|e| NetError::from_io("waker", e))?;
        Ok(PollHandle {
            poller,
            events: Events::with_capacity(events_capacity.max(1)),
            waker: Arc::new(waker),
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Moves `fd` from the `armed` state to `interest`: ADD, MOD or DEL as needed.
    pub fn rearm(&self, fd: RawFd, token: Token, armed: bool, interest: Interest) -> Result<()> {
        match (armed, interest.to_mio()) {
            (false, Some(mask)) => self
                .poller
                .registry()
                .register(&mut SourceFd(&fd), token, mask)
                .map_err(|e| NetError::from_io("epoll_ctl(ADD)", e)),
            (true, Some(mask)) => {
                let registry = self.poller.registry();
                match registry.reregister(&mut SourceFd(&fd), token, mask) {
                    // The descriptor number was closed and reused behind our back.
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => registry
                        .register(&mut SourceFd(&fd), token, mask)
                        .map_err(|e| NetError::from_io("epoll_ctl(ADD)", e)),
                    res => res.map_err(|e| NetError::from_io("epoll_ctl(MOD)", e)),
                }
            }
            (true, None) => self.deregister(fd),
            (false, None) => Ok(()),
        }
    }

    /// Removes `fd` from the kernel set. A descriptor that was already
    /// closed has left the set on its own, so that is not an error.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        match self.poller.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT)) => {
                tracing::trace!(fd, "descriptor already gone from poll set");
                Ok(())
            }
            Err(e) => Err(NetError::from_io("epoll_ctl(DEL)", e)),
        }
    }

    /// Waits for readiness and copies the batch into `batch`.
    ///
    /// A wait interrupted by a signal yields an empty batch; any other
    /// failure is fatal to the caller.
    pub fn poll(
        &mut self,
        batch: &mut Vec<(Token, Readiness)>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        batch.clear();
        match self.poller.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(NetError::from_io("epoll_wait", e)),
        }
        batch.extend(
            self.events
                .iter()
                .map(|event| (event.token(), Readiness::from_mio(event))),
        );
        Ok(batch.len())
    }

    pub fn wake(&self) -> Result<()> {
        self.waker
            .wake()
            .map_err(|e| NetError::from_io("waker", e))
    }
}
