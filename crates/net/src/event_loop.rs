//! The per-thread reactor.
//!
//! An [`EventLoop`] is created on, and never leaves, the thread that runs it.
//! It owns the poller, the timer queue and the registry of connections it
//! hosts. Other threads talk to a loop only through a [`LoopHandle`], which
//! can queue [`Task`]s, schedule timers and ask the loop to quit; an eventfd
//! wakes the loop out of `epoll_wait` when work arrives from outside.
//!
//! Each iteration of [`EventLoop::run`]:
//!
//! 1. waits for readiness (at most ten seconds),
//! 2. dispatches every ready channel in order,
//! 3. drains the task queue, swapping it out under the lock and running the
//!    tasks outside of it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::poller::Poller;
use crate::sys;
use crate::timer::{TimerId, TimerQueue};

/// A unit of work sent to a loop from any thread.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<LoopCore>> = const { RefCell::new(Weak::new()) };
}

/// The part of a loop that other threads may touch.
pub(crate) struct LoopShared {
    thread_id: ThreadId,
    tasks: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

impl LoopShared {
    fn wakeup(&self) {
        match sys::write_u64(&self.wakeup_fd, 1) {
            Ok(()) => {}
            // the counter is saturated, a wakeup is pending anyway
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!(cause = %e, "write eventfd failed"),
        }
    }

    fn drain_wakeup(&self) {
        match sys::read_u64(&self.wakeup_fd) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(cause = %e, "read eventfd failed"),
        }
    }

    fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    fn push_task(&self, task: Task) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);

        // a task queued while the loop drains its queue would otherwise wait for the next poll
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }
}

/// Loop-local state, only ever touched on the loop thread.
pub(crate) struct LoopCore {
    shared: Arc<LoopShared>,
    pub(crate) poller: RefCell<Poller>,
    timers: TimerQueue,
    wakeup_channel: Rc<Channel>,
    looping: Cell<bool>,
    iteration: Cell<u64>,
    connections: RefCell<HashMap<u64, Rc<Connection>>>,
}

impl LoopCore {
    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(
            self.shared.is_in_loop_thread(),
            "EventLoop was created in thread {:?}, current thread is {:?}",
            self.shared.thread_id,
            thread::current().id()
        );
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }
}

/// A reactor bound to the thread that created it.
///
/// Cloning an `EventLoop` gives another reference to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.core.shared.thread_id)
            .field("looping", &self.core.looping.get())
            .field("iteration", &self.core.iteration.get())
            .finish_non_exhaustive()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Creates the loop of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when another loop is alive on this thread. Failing to create the
    /// epoll, eventfd or timerfd descriptors aborts the process.
    pub fn new() -> Self {
        let exists = CURRENT_LOOP.with(|current| current.borrow().strong_count() > 0);
        assert!(!exists, "another EventLoop exists in thread {:?}", thread::current().id());

        let wakeup_fd = sys::eventfd().unwrap_or_else(|e| sys::fatal("eventfd", &e));
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            tasks: Mutex::new(Vec::new()),
            wakeup_fd,
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
        });

        let core = Rc::new_cyclic(|weak: &Weak<LoopCore>| LoopCore {
            wakeup_channel: Channel::new(weak.clone(), shared.wakeup_fd.as_raw_fd()),
            shared,
            poller: RefCell::new(Poller::new()),
            timers: TimerQueue::new(weak.clone()),
            looping: Cell::new(false),
            iteration: Cell::new(0),
            connections: RefCell::new(HashMap::new()),
        });

        let shared = Arc::clone(&core.shared);
        core.wakeup_channel.set_read_callback(move || shared.drain_wakeup());
        core.wakeup_channel.enable_reading(false);
        core.timers.start(Rc::downgrade(&core));

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Rc::downgrade(&core));
        debug!(thread = ?core.shared.thread_id, "event loop created");

        Self { core }
    }

    /// The loop living on the calling thread, if any.
    pub fn current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade()).map(Self::from_core)
    }

    pub(crate) fn from_core(core: Rc<LoopCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &LoopCore {
        &self.core
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopCore> {
        Rc::downgrade(&self.core)
    }

    /// A thread safe handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.core.shared) }
    }

    /// Runs until [`quit`](Self::quit) is called. Tasks queued before the loop
    /// stops still run once more before this returns.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.core.looping.get(), "EventLoop is already running");
        self.core.looping.set(true);
        debug!("event loop start looping");

        let mut active = Vec::new();
        while !self.core.shared.quit.load(Ordering::Acquire) {
            self.core.poller.borrow_mut().poll(POLL_TIMEOUT, &mut active);
            self.core.iteration.set(self.core.iteration.get() + 1);

            for channel in active.drain(..) {
                channel.handle_event();
            }
            self.do_pending_tasks();
        }
        self.do_pending_tasks();

        debug!("event loop stop looping");
        self.core.looping.set(false);
    }

    /// Asks the loop to stop after the current iteration.
    pub fn quit(&self) {
        self.core.shared.quit.store(true, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.core.looping.get()
    }

    /// Number of poll rounds completed so far.
    pub fn iteration(&self) -> u64 {
        self.core.iteration.get()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.core.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.core.assert_in_loop_thread();
    }

    /// Queues `task` to run after the current batch of events.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.core.shared.push_task(Box::new(task));
    }

    pub fn run_at(&self, when: Instant, callback: impl FnMut(&EventLoop) + 'static) -> TimerId {
        let id = TimerId::next();
        self.core.timers.add(id, when, None, Box::new(callback));
        id
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut(&EventLoop) + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut(&EventLoop) + 'static) -> TimerId {
        let id = TimerId::next();
        self.core.timers.add(id, Instant::now() + interval, Some(interval), Box::new(callback));
        id
    }

    pub fn cancel(&self, timer: TimerId) {
        self.core.timers.cancel(timer);
    }

    pub(crate) fn register_connection(&self, conn: Rc<Connection>) {
        self.core.connections.borrow_mut().insert(conn.id(), conn);
    }

    pub(crate) fn unregister_connection(&self, id: u64) -> Option<Rc<Connection>> {
        self.core.connections.borrow_mut().remove(&id)
    }

    /// A live connection hosted by this loop.
    pub fn connection(&self, id: u64) -> Option<Rc<Connection>> {
        self.core.connections.borrow().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.borrow().len()
    }

    fn do_pending_tasks(&self) {
        let tasks = std::mem::take(&mut *self.core.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        trace!(tasks = tasks.len(), "run pending tasks");

        self.core.shared.calling_pending.store(true, Ordering::Release);
        for task in tasks {
            task(self);
        }
        self.core.shared.calling_pending.store(false, Ordering::Release);
    }
}

/// A `Send + Sync` handle used to reach a loop from other threads.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").field("thread", &self.shared.thread_id).finish_non_exhaustive()
    }
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Runs `task` right away when called on the loop thread, otherwise queues it.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            if let Some(event_loop) = EventLoop::current() {
                if Arc::ptr_eq(&event_loop.core.shared, &self.shared) {
                    task(&event_loop);
                    return;
                }
            }
        }
        self.queue_in_loop(task);
    }

    /// Queues `task`, waking the loop when necessary.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.push_task(Box::new(task));
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Asks the loop to stop. Safe to call from any thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    pub fn run_at(&self, when: Instant, callback: impl FnMut(&EventLoop) + Send + 'static) -> TimerId {
        let id = TimerId::next();
        self.run_in_loop(move |event_loop| event_loop.core.timers.add(id, when, None, Box::new(callback)));
        id
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut(&EventLoop) + Send + 'static) -> TimerId {
        let id = TimerId::next();
        let when = Instant::now() + interval;
        self.run_in_loop(move |event_loop| event_loop.core.timers.add(id, when, Some(interval), Box::new(callback)));
        id
    }

    pub fn cancel(&self, timer: TimerId) {
        self.run_in_loop(move |event_loop| event_loop.cancel(timer));
    }
}
