//! Acceptor, worker pool and the lifecycle of every connection.
//!
//! A connection is accepted on the main loop, recorded in the server map and
//! then built and established on a worker loop. Teardown takes three hops:
//!
//! 1. worker: the connection closes and calls its delete callback,
//! 2. main: the fd is erased from the server map,
//! 3. worker: `connection_destroyed` unregisters the channel and drops the
//!    loop's reference, so the socket is closed on the loop that polled it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{
    Callbacks, ConnShared, Connection, ConnectionHandle, ConnectionOptions, DEFAULT_HIGH_WATER_MARK,
};
use crate::error::NetError;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

/// Server settings, built with chained setters.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    name: String,
    thread_num: usize,
    high_water_mark: usize,
    idle_timeout: Option<Duration>,
    edge_triggered: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "ember".to_owned(),
            thread_num: 0,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            idle_timeout: None,
            edge_triggered: true,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Worker loops. `0` runs every connection on the main loop.
    #[must_use]
    pub fn thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self
    }

    #[must_use]
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Close connections that stay silent for `idle_timeout`.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn edge_triggered(mut self, edge_triggered: bool) -> Self {
        self.edge_triggered = edge_triggered;
        self
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_thread_num(&self) -> usize {
        self.thread_num
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions { high_water_mark: self.high_water_mark, idle_timeout: self.idle_timeout, edge_triggered: self.edge_triggered }
    }
}

/// A value only reachable from the thread that created it.
pub(crate) struct ThreadBound<T> {
    owner: ThreadId,
    value: T,
}

// SAFETY: `get` refuses every thread but `owner`, so the value is never touched concurrently;
// `T: Send` covers it being dropped on whichever thread drops the last reference.
unsafe impl<T: Send> Sync for ThreadBound<T> {}

impl<T> ThreadBound<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { owner: thread::current().id(), value }
    }

    pub(crate) fn get(&self) -> &T {
        assert_eq!(self.owner, thread::current().id(), "thread bound value touched from a foreign thread");
        &self.value
    }
}

/// State shared with the worker loops.
struct ServerShared {
    name: String,
    main_loop: LoopHandle,
    connections: ThreadBound<RefCell<HashMap<RawFd, ConnectionHandle>>>,
}

struct ServerInner {
    event_loop: EventLoop,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopThreadPool>,
    shared: Arc<ServerShared>,
    callbacks: RefCell<Callbacks>,
    thread_init: RefCell<Option<ThreadInitCallback>>,
    options: ServerOptions,
    next_conn_id: Cell<u64>,
    started: Cell<bool>,
}

/// A multi reactor TCP server. Lives on, and must be used from, its main loop thread.
pub struct Server {
    inner: Rc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.shared.name)
            .field("local_addr", &self.local_addr().ok())
            .field("started", &self.inner.started.get())
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(event_loop: &EventLoop, addr: SocketAddrV4, options: ServerOptions) -> Result<Self, NetError> {
        let acceptor = Acceptor::bind(event_loop, addr)?;
        let pool = EventLoopThreadPool::new(event_loop.handle(), options.name.clone());
        let shared = Arc::new(ServerShared {
            name: options.name.clone(),
            main_loop: event_loop.handle(),
            connections: ThreadBound::new(RefCell::new(HashMap::new())),
        });

        let inner = Rc::new(ServerInner {
            event_loop: event_loop.clone(),
            acceptor,
            pool: RefCell::new(pool),
            shared,
            callbacks: RefCell::new(Callbacks::default()),
            thread_init: RefCell::new(None),
            options,
            next_conn_id: Cell::new(1),
            started: Cell::new(false),
        });

        let weak: Weak<ServerInner> = Rc::downgrade(&inner);
        inner.acceptor.set_new_connection_callback(move |stream, local, peer| {
            if let Some(inner) = weak.upgrade() {
                inner.new_connection(stream, local, peer);
            }
        });

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn set_connection_callback(&self, callback: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_connection = Some(Arc::new(callback));
    }

    pub fn set_message_callback(&self, callback: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_message = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback(&self, callback: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_write_complete = Some(Arc::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_close = Some(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&Rc<Connection>) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_error = Some(Arc::new(callback));
    }

    pub fn set_high_water_mark_callback(&self, callback: impl Fn(&Rc<Connection>, usize) + Send + Sync + 'static) {
        self.inner.callbacks.borrow_mut().on_high_water_mark = Some(Arc::new(callback));
    }

    /// Replaces every callback at once.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.inner.callbacks.borrow_mut() = callbacks;
    }

    pub fn set_thread_init_callback(&self, callback: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.inner.thread_init.borrow_mut() = Some(Arc::new(callback));
    }

    /// Starts the worker loops and begins accepting. Calling it again does nothing.
    pub fn start(&self) -> Result<(), NetError> {
        self.inner.event_loop.assert_in_loop_thread();
        if self.inner.started.replace(true) {
            return Ok(());
        }

        let init = self.inner.thread_init.borrow().clone();
        self.inner.pool.borrow_mut().start(self.inner.options.thread_num, init.as_ref())?;
        self.inner.acceptor.listen();
        info!(name = %self.name(), threads = self.inner.options.thread_num, "server started");
        Ok(())
    }

    /// Live connections. Only meaningful on the main loop thread.
    pub fn connection_count(&self) -> usize {
        self.inner.shared.connections.get().borrow().len()
    }

    /// Handles of all live connections.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.shared.connections.get().borrow().values().cloned().collect()
    }

    pub fn worker_loops(&self) -> Vec<LoopHandle> {
        self.inner.pool.borrow().all_loops()
    }
}

impl ServerInner {
    fn new_connection(&self, stream: TcpStream, local: SocketAddr, peer: SocketAddr) {
        self.event_loop.assert_in_loop_thread();

        let io_loop = self.pool.borrow_mut().next_loop();
        let id = self.next_conn_id.replace(self.next_conn_id.get() + 1);
        let name = format!("{}-{}#{}", self.shared.name, local, id);
        info!(name = %name, %peer, "new connection");

        let conn_shared = Arc::new(ConnShared::new(id, &stream, name, local, peer, io_loop.clone()));
        let fd = stream.as_raw_fd();
        let previous = self.shared.connections.get().borrow_mut().insert(fd, ConnectionHandle::new(Arc::clone(&conn_shared)));
        if let Some(previous) = previous {
            warn!(fd, stale = previous.id(), "replace a stale connection entry");
        }

        let callbacks = self.callbacks.borrow().clone();
        let options = self.options.connection_options();
        let server = Arc::clone(&self.shared);
        io_loop.run_in_loop(move |event_loop| {
            let conn = Connection::new(event_loop, conn_shared, stream, callbacks, options);
            conn.set_delete_callback(move |conn| ServerShared::remove_connection(&server, conn));
            conn.connection_established(event_loop);
        });
    }
}

impl ServerShared {
    /// Hop 1, on the connection's loop.
    fn remove_connection(server: &Arc<ServerShared>, conn: &Rc<Connection>) {
        let fd = conn.fd();
        let id = conn.id();
        let conn_loop = conn.loop_handle().clone();
        let server = Arc::clone(server);
        let main_loop = server.main_loop.clone();

        main_loop.run_in_loop(move |_| {
            // hop 2, on the main loop
            let mut connections = server.connections.get().borrow_mut();
            match connections.get(&fd) {
                Some(handle) if handle.id() == id => {
                    connections.remove(&fd);
                    info!(server = %server.name, conn = id, "remove connection");
                }
                _ => warn!(server = %server.name, conn = id, "connection already removed"),
            }
            drop(connections);

            // hop 3, back on the connection's loop
            conn_loop.queue_in_loop(move |event_loop| {
                if let Some(conn) = event_loop.connection(id) {
                    conn.connection_destroyed(event_loop);
                }
            });
        });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!(name = %self.name(), "server dropping");
        let handles: Vec<ConnectionHandle> = self.inner.shared.connections.get().borrow_mut().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            let id = handle.id();
            handle.loop_handle().run_in_loop(move |event_loop| {
                if let Some(conn) = event_loop.connection(id) {
                    conn.connection_destroyed(event_loop);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn thread_bound_checks_owner() {
        let bound = Arc::new(ThreadBound::new(RefCell::new(1)));
        *bound.get().borrow_mut() += 1;
        assert_eq!(*bound.get().borrow(), 2);

        let other = Arc::clone(&bound);
        let result = thread::spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| *other.get().borrow())).is_err())
            .join()
            .unwrap();
        assert!(result);
    }

    #[test]
    fn options_builder() {
        let options = ServerOptions::new().name("echo").thread_num(4).idle_timeout(Some(Duration::from_secs(2))).edge_triggered(false);
        assert_eq!(options.get_name(), "echo");
        assert_eq!(options.get_thread_num(), 4);
        let conn = options.connection_options();
        assert_eq!(conn.idle_timeout, Some(Duration::from_secs(2)));
        assert!(!conn.edge_triggered);
        assert_eq!(conn.high_water_mark, DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn start_is_idempotent() {
        let event_loop = EventLoop::new();
        let server = Server::new(&event_loop, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), ServerOptions::new()).unwrap();
        server.start().unwrap();
        server.start().unwrap();
        assert_eq!(server.worker_loops().len(), 1);
        assert_eq!(server.connection_count(), 0);
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
