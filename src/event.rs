use std::{fmt, ops::BitOr, os::fd::RawFd};

/// Interest mask for a registered descriptor.
///
/// Any combination of read and write, including none. A registration with
/// no interest stays in the loop's table but is de-armed in the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READ | WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

/// Readiness reported for one descriptor in a dispatch batch.
///
/// Error and hangup conditions are folded into both directions before a
/// handler sees them, so a handler watching only one side still observes a
/// failing socket. [`is_error`](Self::is_error) and
/// [`is_hangup`](Self::is_hangup) keep the original cause.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    fd: RawFd,
    readable: bool,
    writable: bool,
    error: bool,
    hangup: bool,
}

impl Readiness {
    pub fn new(fd: RawFd, readable: bool, writable: bool, error: bool, hangup: bool) -> Self {
        let failed = error || hangup;
        Self {
            fd,
            readable: readable || failed,
            writable: writable || failed,
            error,
            hangup,
        }
    }

    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        Self::new(
            -1,
            event.is_readable(),
            event.is_writable(),
            event.is_error(),
            event.is_read_closed() || event.is_write_closed(),
        )
    }

    pub(crate) fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = fd;
        self
    }

    /// Restricts the readiness to what the handler asked for.
    pub(crate) fn masked(self, interest: Interest) -> Option<Self> {
        let readable = self.readable && interest.is_readable();
        let writable = self.writable && interest.is_writable();
        if !readable && !writable {
            return None;
        }
        Some(Self {
            readable,
            writable,
            ..self
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("fd", &self.fd)
            .field("is_readable", &self.readable)
            .field("is_writable", &self.writable)
            .field("is_error", &self.error)
            .field("is_hangup", &self.hangup)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bits() {
        let both = Interest::READ | Interest::WRITE;
        assert_eq!(both, Interest::READ_WRITE);
        assert!(both.is_readable() && both.is_writable());
        assert_eq!(both.remove(Interest::WRITE), Interest::READ);
        assert!(Interest::NONE.is_none());
        assert!(Interest::NONE.to_mio().is_none());
        assert_eq!(format!("{:?}", both), "READ | WRITE");
    }

    #[test]
    fn test_error_folds_into_both_directions() {
        let ready = Readiness::new(3, false, false, true, false);
        assert!(ready.is_readable());
        assert!(ready.is_writable());

        let write_only = ready.masked(Interest::WRITE).unwrap();
        assert!(write_only.is_writable());
        assert!(!write_only.is_readable());
        assert!(write_only.is_error());
    }

    #[test]
    fn test_mask_drops_unwanted_events() {
        let ready = Readiness::new(3, false, true, false, false);
        assert!(ready.masked(Interest::READ).is_none());
        assert!(ready.masked(Interest::READ_WRITE).is_some());
    }
}
