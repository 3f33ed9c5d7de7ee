use std::{collections::HashMap, os::fd::RawFd};

use crate::{
    event::{Interest, Readiness},
    reactor::EventLoop,
};

/// Readiness callback for a registered descriptor.
///
/// Handlers run on the loop thread. They receive the loop itself so they
/// can register, re-arm or remove descriptors (including their own) and
/// request a stop while handling an event. Any `FnMut(&EventLoop, Readiness)`
/// closure is a handler.
pub trait EventHandler {
    fn handle_event(&mut self, event_loop: &EventLoop, ready: Readiness);
}

impl<F> EventHandler for F
where
    F: FnMut(&EventLoop, Readiness),
{
    fn handle_event(&mut self, event_loop: &EventLoop, ready: Readiness) {
        self(event_loop, ready)
    }
}

pub type BoxedHandler = Box<dyn EventHandler>;

pub(crate) struct HandlerEntry {
    pub fd: RawFd,
    pub interest: Interest,
    /// Whether the descriptor is currently known to the kernel multiplexer.
    pub armed: bool,
    /// Removed while a batch was in flight; freed once the batch ends.
    pub closed: bool,
    /// `None` while the handler is running.
    pub handler: Option<BoxedHandler>,
}

impl HandlerEntry {
    pub fn new(fd: RawFd, interest: Interest, handler: BoxedHandler) -> Self {
        HandlerEntry {
            fd,
            interest,
            armed: !interest.is_none(),
            closed: false,
            handler: Some(handler),
        }
    }
}

/// Slot table backing the loop's registrations.
///
/// The slot index doubles as the multiplexer token. Slots freed during a
/// dispatch batch are parked until the batch ends, so a token from the
/// current batch can never name a newer registration.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    slots: Vec<Option<HandlerEntry>>,
    vacant: Vec<usize>,
    by_fd: HashMap<RawFd, usize>,
    parked: Vec<usize>,
}

impl HandlerRegistry {
    pub fn slot_of(&self, fd: RawFd) -> Option<usize> {
        self.by_fd.get(&fd).copied()
    }

    pub fn get(&self, slot: usize) -> Option<&HandlerEntry> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut HandlerEntry> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// The slot the next insert will use.
    pub fn next_slot(&self) -> usize {
        self.vacant.last().copied().unwrap_or(self.slots.len())
    }

    pub fn insert(&mut self, entry: HandlerEntry) -> usize {
        let fd = entry.fd;
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.by_fd.insert(fd, slot);
        slot
    }

    /// Unlinks `fd` and frees its slot right away.
    pub fn remove(&mut self, fd: RawFd) -> Option<HandlerEntry> {
        let slot = self.by_fd.remove(&fd)?;
        let entry = self.slots.get_mut(slot).and_then(Option::take);
        self.vacant.push(slot);
        entry
    }

    /// Unlinks `fd` but keeps its slot, marked closed, until [`purge`](Self::purge).
    pub fn park(&mut self, fd: RawFd) -> Option<&mut HandlerEntry> {
        let slot = self.by_fd.remove(&fd)?;
        self.parked.push(slot);
        let entry = self.slots.get_mut(slot).and_then(Option::as_mut)?;
        entry.closed = true;
        Some(entry)
    }

    /// Frees every parked slot and hands back their entries for dropping.
    pub fn purge(&mut self) -> Vec<HandlerEntry> {
        let mut freed = Vec::with_capacity(self.parked.len());
        for slot in self.parked.drain(..) {
            if let Some(entry) = self.slots.get_mut(slot).and_then(Option::take) {
                freed.push(entry);
            }
            self.vacant.push(slot);
        }
        freed
    }

    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &EventLoop, _: Readiness) {}

    fn entry(fd: RawFd, interest: Interest) -> HandlerEntry {
        HandlerEntry::new(fd, interest, Box::new(noop))
    }

    #[test]
    fn test_insert_and_remove_reuses_slot() {
        let mut registry = HandlerRegistry::default();
        let a = registry.insert(entry(10, Interest::READ));
        let b = registry.insert(entry(11, Interest::WRITE));
        assert_ne!(a, b);
        assert_eq!(registry.slot_of(11), Some(b));

        assert!(registry.remove(10).is_some());
        assert_eq!(registry.slot_of(10), None);
        assert_eq!(registry.next_slot(), a);
        assert_eq!(registry.insert(entry(12, Interest::READ)), a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_parked_slots_survive_until_purge() {
        let mut registry = HandlerRegistry::default();
        let slot = registry.insert(entry(7, Interest::READ));

        assert!(registry.park(7).is_some());
        assert_eq!(registry.slot_of(7), None);
        assert!(registry.get(slot).unwrap().closed);

        let other = registry.insert(entry(7, Interest::READ));
        assert_ne!(other, slot);

        let freed = registry.purge();
        assert_eq!(freed.len(), 1);
        assert!(registry.get(slot).is_none());
        assert_eq!(registry.slot_of(7), Some(other));
    }

    #[test]
    fn test_armed_follows_interest() {
        assert!(!entry(3, Interest::NONE).armed);
        assert!(entry(3, Interest::READ).armed);
    }
}
