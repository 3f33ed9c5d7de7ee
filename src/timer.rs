use std::{
    cell::Cell,
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::reactor::EventLoop;

pub type TimerCallback = Box<dyn FnMut(&EventLoop)>;

/// Handle to a scheduled timer.
///
/// Cancelling is idempotent and also stops a repeating timer from being
/// rescheduled if it is cancelled from inside its own callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

pub(crate) struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    interval: Duration,
    repeat: bool,
    cancelled: Rc<Cell<bool>>,
    pub callback: TimerCallback,
}

impl TimerEntry {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn repeats(&self) -> bool {
        self.repeat && !self.cancelled.get()
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline, FIFO among equals.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

// Stands in for intervals too large for `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(start: Instant, interval: Duration) -> Instant {
    start
        .checked_add(interval)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Deadline-ordered timer queue.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    sequence: u64,
}

impl TimerQueue {
    pub fn insert(&mut self, interval: Duration, repeat: bool, callback: TimerCallback) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let id = self.next_sequence();
        self.heap.push(TimerEntry {
            deadline: deadline_after(Instant::now(), interval),
            sequence: id,
            interval,
            repeat,
            cancelled: Rc::clone(&cancelled),
            callback,
        });
        TimerHandle { id, cancelled }
    }

    /// Earliest live deadline. Cancelled entries at the head are dropped.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    /// Removes every entry due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|head| head.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                if !entry.is_cancelled() {
                    due.push(entry);
                }
            }
        }
        due
    }

    /// Puts a repeating entry back one interval later.
    pub fn reschedule(&mut self, mut entry: TimerEntry, now: Instant) {
        let next = deadline_after(entry.deadline, entry.interval);
        // A loop that fell behind does not replay missed ticks.
        entry.deadline = if next > now {
            next
        } else {
            deadline_after(now, entry.interval)
        };
        entry.sequence = self.next_sequence();
        self.heap.push(entry);
    }

    pub fn len(&self) -> usize {
        self.heap.iter().filter(|entry| !entry.is_cancelled()).count()
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_: &EventLoop| {})
    }

    #[test]
    fn test_orders_by_deadline() {
        let mut queue = TimerQueue::default();
        let late = queue.insert(Duration::from_millis(50), false, noop());
        let early = queue.insert(Duration::ZERO, false, noop());

        let now = Instant::now();
        let due = queue.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sequence, early.id());
        assert_eq!(queue.len(), 1);
        assert!(!late.is_cancelled());
    }

    #[test]
    fn test_cancelled_timers_are_skipped() {
        let mut queue = TimerQueue::default();
        let handle = queue.insert(Duration::ZERO, false, noop());
        handle.cancel();
        assert!(queue.next_deadline().is_none());
        assert!(queue.take_due(Instant::now()).is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_reschedule_skips_missed_ticks() {
        let mut queue = TimerQueue::default();
        queue.insert(Duration::from_millis(1), true, noop());
        let later = Instant::now() + Duration::from_millis(100);
        let mut due = queue.take_due(later);
        let entry = due.pop().unwrap();
        assert!(entry.repeats());

        queue.reschedule(entry, later);
        let next = queue.next_deadline().unwrap();
        assert!(next > later);
    }

    #[test]
    fn test_huge_interval_never_comes_due() {
        let mut queue = TimerQueue::default();
        let handle = queue.insert(Duration::MAX, true, noop());
        let now = Instant::now();
        assert!(queue.next_deadline().unwrap() > now + Duration::from_secs(3600));
        assert!(queue.take_due(now).is_empty());
        assert_eq!(queue.len(), 1);
        assert!(!handle.is_cancelled());
    }
}
