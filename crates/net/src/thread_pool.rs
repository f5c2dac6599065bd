//! Worker threads, each running one [`EventLoop`].

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::NetError;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on every worker loop before it starts looping.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// A thread that owns and runs a single loop. Dropping it quits the loop and joins the thread.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThread").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl EventLoopThread {
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> Result<Self, NetError> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(init) = init {
                    init(&event_loop);
                }
                if tx.send(event_loop.handle()).is_err() {
                    return;
                }
                event_loop.run();
            })
            .map_err(|e| NetError::spawn(&name, e))?;

        let handle = rx.recv().map_err(|_| NetError::spawn(&name, std::io::Error::other("event loop thread exited early")))?;
        debug!(name = %name, "event loop thread started");
        Ok(Self { handle, thread: Some(thread) })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

/// `N` worker loops handed out round robin. With no workers every
/// request falls back to the base loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    threads: Vec<EventLoopThread>,
    next: usize,
    started: bool,
}

impl fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("threads", &self.threads.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> Self {
        Self { base, name: name.into(), threads: Vec::new(), next: 0, started: false }
    }

    pub fn start(&mut self, num_threads: usize, init: Option<&ThreadInitCallback>) -> Result<(), NetError> {
        assert!(self.base.is_in_loop_thread(), "thread pool must be started on its base loop thread");
        assert!(!self.started, "thread pool {} started twice", self.name);
        self.started = true;

        for i in 0..num_threads {
            let thread = EventLoopThread::start(format!("{}-{i}", self.name), init.cloned())?;
            self.threads.push(thread);
        }
        if num_threads == 0 {
            if let (Some(init), Some(base)) = (init, EventLoop::current()) {
                init(&base);
            }
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Picks the next worker loop, round robin.
    pub fn next_loop(&mut self) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let handle = self.threads[self.next].handle().clone();
        self.next = (self.next + 1) % self.threads.len();
        handle
    }

    /// Always the same loop for the same hash.
    pub fn loop_for_hash(&self, hash: usize) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        self.threads[hash % self.threads.len()].handle().clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.threads.is_empty() {
            return vec![self.base.clone()];
        }
        self.threads.iter().map(|t| t.handle().clone()).collect()
    }
}
