use std::{
    cell::{Cell, RefCell},
    fmt,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use mio::{Token, Waker};
use serde::{Deserialize, Serialize};

use crate::{
    error::{NetError, Result},
    event::{Interest, Readiness},
    handler::{BoxedHandler, EventHandler, HandlerEntry, HandlerRegistry},
    poll::{PollHandle, WAKE_TOKEN},
    timer::{TimerHandle, TimerQueue},
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

type Task = Box<dyn FnOnce(&EventLoop) + Send>;

/// Tuning knobs for an [`EventLoop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Maximum readiness events fetched per multiplexer wait.
    pub events_capacity: usize,
    /// Upper bound on a single wait. `None` waits for I/O or the next timer.
    pub poll_timeout: Option<Duration>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Some(Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS)),
        }
    }
}

struct Shared {
    stop: AtomicBool,
    waker: Arc<Waker>,
}

/// Single-threaded readiness loop.
///
/// The loop owns the kernel multiplexer, a table of descriptor registrations
/// and a deadline-ordered timer queue. Exactly one thread drives it through
/// [`run`](Self::run) or [`run_once`](Self::run_once); every callback runs on
/// that thread and receives `&EventLoop`, so callbacks may register, re-arm
/// or remove descriptors, add timers and request a stop.
///
/// Readiness is edge-triggered: a callback must drain its descriptor until it
/// would block, or re-arm it with [`modify_io`](Self::modify_io).
///
/// ## Example
///
/// ```rust,no_run
/// use mill_tcp::{EventLoop, Interest, TcpListener};
///
/// # fn main() -> mill_tcp::error::Result<()> {
/// let event_loop = EventLoop::new()?;
/// let listener = TcpListener::new(0)?;
/// let fd = listener.fd();
///
/// event_loop.add_io(fd, Interest::READ, move |_, _| {
///     while let Some(conn) = listener.accept() {
///         println!("client from {}:{}", conn.peer_address(), conn.peer_port());
///     }
/// })?;
/// event_loop.run()
/// # }
/// ```
pub struct EventLoop {
    poller: RefCell<PollHandle>,
    registry: RefCell<HandlerRegistry>,
    timers: RefCell<TimerQueue>,
    batch: RefCell<Vec<(Token, Readiness)>>,
    dispatching: Cell<bool>,
    shared: Arc<Shared>,
    tasks: mpsc::Receiver<Task>,
    sender: mpsc::Sender<Task>,
    config: EventLoopConfig,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<Self> {
        if config.events_capacity == 0 {
            return Err(NetError::Configuration(
                "events_capacity must be greater than zero".into(),
            ));
        }
        let poller = PollHandle::new(config.events_capacity)?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            waker: poller.waker(),
        });
        let (sender, tasks) = mpsc::channel();
        Ok(Self {
            poller: RefCell::new(poller),
            registry: RefCell::new(HandlerRegistry::default()),
            timers: RefCell::new(TimerQueue::default()),
            batch: RefCell::new(Vec::with_capacity(config.events_capacity)),
            dispatching: Cell::new(false),
            shared,
            tasks,
            sender,
            config,
        })
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.config
    }

    /// Registers `fd` with `interest` and a readiness callback.
    ///
    /// Registering a descriptor that is already known replaces its callback
    /// and re-arms it with the new mask.
    pub fn add_io<F>(&self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(&EventLoop, Readiness) + 'static,
    {
        self.add_handler(fd, interest, callback)
    }

    /// Like [`add_io`](Self::add_io) for a named [`EventHandler`] type.
    pub fn add_handler<H>(&self, fd: RawFd, interest: Interest, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        if fd < 0 {
            return Err(NetError::Closed);
        }
        let handler: BoxedHandler = Box::new(handler);
        let mut registry = self.registry.borrow_mut();

        let replaced = match registry.slot_of(fd) {
            Some(slot) => {
                let Some(entry) = registry.get_mut(slot) else {
                    return Err(NetError::NotRegistered { fd });
                };
                self.poller
                    .borrow()
                    .rearm(fd, Token(slot), entry.armed, interest)?;
                entry.armed = !interest.is_none();
                entry.interest = interest;
                entry.handler.replace(handler)
            }
            None => {
                let slot = registry.next_slot();
                self.poller
                    .borrow()
                    .rearm(fd, Token(slot), false, interest)?;
                registry.insert(HandlerEntry::new(fd, interest, handler));
                None
            }
        };
        drop(registry);
        tracing::trace!(fd, ?interest, replaced = replaced.is_some(), "registered descriptor");
        Ok(())
    }

    /// Changes the interest mask of an existing registration.
    ///
    /// Arming a direction that is already ready makes the kernel report it
    /// again on the next wait.
    pub fn modify_io(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let slot = registry
            .slot_of(fd)
            .ok_or(NetError::NotRegistered { fd })?;
        let entry = registry
            .get_mut(slot)
            .ok_or(NetError::NotRegistered { fd })?;
        self.poller
            .borrow()
            .rearm(fd, Token(slot), entry.armed, interest)?;
        entry.armed = !interest.is_none();
        entry.interest = interest;
        tracing::trace!(fd, ?interest, "re-armed descriptor");
        Ok(())
    }

    /// Removes the registration for `fd`. Unknown descriptors are ignored.
    ///
    /// While a readiness batch is being dispatched the entry is only marked
    /// closed: it receives no further events and is freed once the batch ends.
    pub fn remove_io(&self, fd: RawFd) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let Some(slot) = registry.slot_of(fd) else {
            return Ok(());
        };
        let armed = registry.get(slot).is_some_and(|entry| entry.armed);
        let res = if armed {
            self.poller.borrow().deregister(fd)
        } else {
            Ok(())
        };

        let removed = if self.dispatching.get() {
            if let Some(entry) = registry.park(fd) {
                entry.armed = false;
            }
            None
        } else {
            registry.remove(fd)
        };
        drop(registry);
        drop(removed);
        tracing::trace!(fd, deferred = self.dispatching.get(), "removed descriptor");
        res
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.borrow().slot_of(fd).is_some()
    }

    pub fn interest_of(&self, fd: RawFd) -> Option<Interest> {
        let registry = self.registry.borrow();
        let slot = registry.slot_of(fd)?;
        registry.get(slot).map(|entry| entry.interest)
    }

    pub fn registered_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Schedules `callback` after `interval`, and every `interval` thereafter
    /// when `repeat` is set.
    pub fn add_timer<F>(&self, interval: Duration, callback: F, repeat: bool) -> TimerHandle
    where
        F: FnMut(&EventLoop) + 'static,
    {
        let handle = self
            .timers
            .borrow_mut()
            .insert(interval, repeat, Box::new(callback));
        tracing::trace!(id = handle.id(), ?interval, repeat, "timer scheduled");
        handle
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Runs until [`stop`](Self::stop) is requested.
    ///
    /// The stop flag is checked between iterations, so the batch in flight
    /// always completes. A stop requested before `run` is entered makes it
    /// return at once. A failed multiplexer wait aborts the loop.
    pub fn run(&self) -> Result<()> {
        tracing::debug!(
            registrations = self.registered_count(),
            "event loop running"
        );
        loop {
            if self.shared.stop.swap(false, Ordering::AcqRel) {
                break;
            }
            self.run_once(self.config.poll_timeout)?;
        }
        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// One iteration: wait, dispatch the readiness batch, drain posted
    /// tasks, then fire due timers. Returns the number of I/O callbacks run.
    ///
    /// The wait never outlasts the next timer deadline or `bound`.
    pub fn run_once(&self, bound: Option<Duration>) -> Result<usize> {
        let timeout = self.next_timeout(bound);

        let mut batch = self.batch.take();
        if let Err(e) = self.poller.borrow_mut().poll(&mut batch, timeout) {
            self.batch.replace(batch);
            tracing::error!(error = %e, "readiness wait failed");
            return Err(e);
        }
        let dispatched = self.dispatch(&batch);
        batch.clear();
        self.batch.replace(batch);

        self.drain_tasks();
        self.fire_timers();
        Ok(dispatched)
    }

    /// Requests a stop from the loop thread.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// A `Send` handle for stopping the loop or posting work from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
            tasks: self.sender.clone(),
        }
    }

    fn next_timeout(&self, bound: Option<Duration>) -> Option<Duration> {
        let until_timer = self
            .timers
            .borrow_mut()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (until_timer, bound) {
            (Some(timer), Some(bound)) => Some(timer.min(bound)),
            (timer, bound) => timer.or(bound),
        }
    }

    fn dispatch(&self, batch: &[(Token, Readiness)]) -> usize {
        let outer = self.dispatching.replace(true);
        let mut dispatched = 0;

        for &(token, ready) in batch {
            if token == WAKE_TOKEN {
                continue;
            }
            let slot = token.0;
            let taken = {
                let mut registry = self.registry.borrow_mut();
                match registry.get_mut(slot) {
                    Some(entry) if !entry.closed => ready
                        .masked(entry.interest)
                        .and_then(|ready| {
                            let ready = ready.with_fd(entry.fd);
                            entry.handler.take().map(|handler| (handler, ready))
                        }),
                    _ => None,
                }
            };
            let Some((mut handler, ready)) = taken else {
                continue;
            };
            handler.handle_event(self, ready);
            dispatched += 1;
            self.restore(slot, handler);
        }

        self.dispatching.set(outer);
        if !outer {
            let freed = self.registry.borrow_mut().purge();
            drop(freed);
        }
        dispatched
    }

    // Puts a handler back after it ran, unless it was removed or replaced meanwhile.
    fn restore(&self, slot: usize, handler: BoxedHandler) {
        let mut registry = self.registry.borrow_mut();
        if let Some(entry) = registry.get_mut(slot) {
            if !entry.closed && entry.handler.is_none() {
                entry.handler = Some(handler);
                return;
            }
        }
        drop(registry);
        drop(handler);
    }

    fn drain_tasks(&self) {
        // Tasks posted while draining wait for the next iteration.
        let pending: Vec<Task> = self.tasks.try_iter().collect();
        for task in pending {
            task(self);
        }
    }

    fn fire_timers(&self) -> usize {
        let now = Instant::now();
        let due = self.timers.borrow_mut().take_due(now);
        let mut fired = 0;
        for mut entry in due {
            // An earlier callback in this pass may have cancelled it.
            if entry.is_cancelled() {
                continue;
            }
            (entry.callback)(self);
            fired += 1;
            if entry.repeats() {
                self.timers.borrow_mut().reschedule(entry, now);
            }
        }
        fired
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("registrations", &self.registered_count())
            .field("timers", &self.timer_count())
            .field("config", &self.config)
            .finish()
    }
}

/// Cross-thread handle to an [`EventLoop`].
///
/// Posted closures run on the loop thread after the current readiness
/// batch, in posting order.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
    tasks: mpsc::Sender<Task>,
}

impl LoopHandle {
    /// Requests a stop and wakes the loop if it is waiting.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!(error = %e, "failed to wake event loop");
        }
    }

    /// Queues `task` for the loop thread. Fails with [`NetError::Closed`]
    /// once the loop has been dropped.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| NetError::Closed)?;
        self.shared
            .waker
            .wake()
            .map_err(|e| NetError::from_io("waker", e))
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("stop_requested", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}
