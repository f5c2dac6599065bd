//! One accepted TCP socket and its state machine.
//!
//! A [`Connection`] is loop-local: it is built on, and only ever touched by,
//! the worker loop that owns it. Code on other threads holds a
//! [`ConnectionHandle`] instead, which carries the immutable facts about the
//! connection plus an atomic state and can schedule closures onto the owning
//! loop.
//!
//! ```text
//!  Invalid --connection_established--> Connected --handle_close--> Closed
//! ```
//!
//! Outbound data is kept in order: the outbound buffer is written first, then
//! any pending file segments, each followed by whatever was sent after it.

use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys;
use crate::timer::TimerId;

/// Default outbound buffer size that triggers the high water mark callback.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Largest chunk handed to a single `sendfile` call.
const MAX_SENDFILE_CHUNK: u64 = 1 << 30;

pub type ConnectionCallback = Arc<dyn Fn(&Rc<Connection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Rc<Connection>, usize) + Send + Sync>;
pub(crate) type DeleteCallback = Box<dyn FnOnce(&Rc<Connection>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Invalid = 0,
    Handshaking = 1,
    Connected = 2,
    Closed = 3,
    Failed = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Handshaking,
            2 => Self::Connected,
            3 => Self::Closed,
            4 => Self::Failed,
            _ => Self::Invalid,
        }
    }
}

/// Application callbacks. They run on the connection's loop thread and are
/// shared by every connection of a server, hence `Send + Sync`.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_connection: Option<ConnectionCallback>,
    pub on_message: Option<ConnectionCallback>,
    pub on_write_complete: Option<ConnectionCallback>,
    pub on_close: Option<ConnectionCallback>,
    pub on_error: Option<ConnectionCallback>,
    pub on_high_water_mark: Option<HighWaterMarkCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_write_complete", &self.on_write_complete.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_high_water_mark", &self.on_high_water_mark.is_some())
            .finish()
    }
}

/// Per-connection settings copied from the server options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub high_water_mark: usize,
    pub idle_timeout: Option<Duration>,
    pub edge_triggered: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { high_water_mark: DEFAULT_HIGH_WATER_MARK, idle_timeout: None, edge_triggered: true }
    }
}

/// Facts about a connection that any thread may read.
#[derive(Debug)]
pub(crate) struct ConnShared {
    id: u64,
    fd: RawFd,
    name: String,
    local: SocketAddr,
    peer: SocketAddr,
    state: AtomicU8,
    loop_handle: LoopHandle,
}

impl ConnShared {
    pub(crate) fn new(id: u64, stream: &TcpStream, name: String, local: SocketAddr, peer: SocketAddr, loop_handle: LoopHandle) -> Self {
        Self { id, fd: stream.as_raw_fd(), name, local, peer, state: AtomicU8::new(ConnState::Invalid as u8), loop_handle }
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A file range queued behind the outbound buffer.
struct FileSegment {
    file: File,
    offset: u64,
    remaining: u64,
    /// bytes sent after this file, written once the file is done
    trailing: Buffer,
}

impl FileSegment {
    /// Pushes file bytes until done (`Ok(true)`) or the socket is full (`Ok(false)`).
    fn transfer(&mut self, socket: RawFd) -> io::Result<bool> {
        while self.remaining > 0 {
            let chunk = usize::try_from(self.remaining.min(MAX_SENDFILE_CHUNK)).unwrap_or(usize::MAX);
            match sys::sendfile(socket, self.file.as_raw_fd(), &mut self.offset, chunk) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file is shorter than the requested range")),
                Ok(n) => self.remaining -= n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

enum WriteProgress {
    Drained,
    Blocked,
    Failed(io::Error),
}

pub struct Connection {
    shared: Arc<ConnShared>,
    stream: TcpStream,
    channel: Rc<Channel>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    pending_files: RefCell<VecDeque<FileSegment>>,
    callbacks: Callbacks,
    options: ConnectionOptions,
    delete_callback: RefCell<Option<DeleteCallback>>,
    write_closed: Cell<bool>,
    shutdown_pending: Cell<bool>,
    last_active: Cell<Instant>,
    idle_timer: Cell<Option<TimerId>>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("fd", &self.shared.fd)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        event_loop: &EventLoop,
        shared: Arc<ConnShared>,
        stream: TcpStream,
        callbacks: Callbacks,
        options: ConnectionOptions,
    ) -> Rc<Self> {
        event_loop.assert_in_loop_thread();
        let channel = Channel::new(event_loop.downgrade(), stream.as_raw_fd());
        debug!(name = %shared.name, fd = shared.fd, "connection created");

        Rc::new(Self {
            shared,
            stream,
            channel,
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
            pending_files: RefCell::new(VecDeque::new()),
            callbacks,
            options,
            delete_callback: RefCell::new(None),
            write_closed: Cell::new(false),
            shutdown_pending: Cell::new(false),
            last_active: Cell::new(Instant::now()),
            idle_timer: Cell::new(None),
            context: RefCell::new(None),
        })
    }

    /// Wraps an already connected socket on the calling loop. Used by servers
    /// and by code that owns both ends of a socket pair.
    pub fn from_stream(
        event_loop: &EventLoop,
        id: u64,
        stream: TcpStream,
        callbacks: Callbacks,
        options: ConnectionOptions,
    ) -> io::Result<Rc<Self>> {
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let shared = Arc::new(ConnShared::new(id, &stream, format!("conn#{id}"), local, peer, event_loop.handle()));
        Ok(Self::new(event_loop, shared, stream, callbacks, options))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.shared.loop_handle
    }

    /// A `Send` handle to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle { shared: Arc::clone(&self.shared) }
    }

    /// The inbound buffer. Do not hold the borrow across calls that may read.
    pub fn input(&self) -> RefMut<'_, Buffer> {
        self.input.borrow_mut()
    }

    /// Bytes waiting to be written, not counting pending file ranges.
    pub fn output_bytes(&self) -> usize {
        self.queued_bytes()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active.get()
    }

    pub fn set_context<T: Any>(&self, context: T) {
        *self.context.borrow_mut() = Some(Box::new(context));
    }

    pub fn has_context(&self) -> bool {
        self.context.borrow().is_some()
    }

    /// The context, if one of type `T` is set.
    pub fn context<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.context.borrow_mut(), |slot| slot.as_mut().and_then(|ctx| ctx.downcast_mut::<T>())).ok()
    }

    pub fn take_context<T: Any>(&self) -> Option<T> {
        let mut slot = self.context.borrow_mut();
        if slot.as_ref().is_some_and(|ctx| ctx.is::<T>()) {
            slot.take().and_then(|ctx| ctx.downcast::<T>().ok()).map(|ctx| *ctx)
        } else {
            None
        }
    }

    pub(crate) fn set_delete_callback(&self, callback: impl FnOnce(&Rc<Connection>) + 'static) {
        *self.delete_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Wires the channel, starts reading and announces the connection.
    pub fn connection_established(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Invalid, "connection {} established twice", self.name());
        self.shared.set_state(ConnState::Connected);

        let weak = Rc::downgrade(self);
        self.channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = Rc::downgrade(self);
        self.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Rc::downgrade(self);
        self.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Rc::downgrade(self);
        self.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        let owner: Rc<dyn Any> = Rc::clone(self) as Rc<dyn Any>;
        self.channel.tie(&owner);

        event_loop.register_connection(Rc::clone(self));
        self.channel.enable_reading(self.options.edge_triggered);
        self.last_active.set(Instant::now());

        if let Some(timeout) = self.options.idle_timeout {
            self.schedule_idle_check(event_loop, timeout);
        }

        debug!(name = %self.name(), peer = %self.peer_addr(), "connection up");
        if let Some(callback) = &self.callbacks.on_connection {
            callback(self);
        }
    }

    /// Last step of the teardown, always run on the owning loop.
    pub fn connection_destroyed(self: &Rc<Self>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.shared.set_state(ConnState::Closed);
            self.channel.disable_all();
            self.cancel_idle_timer(event_loop);
            if let Some(callback) = &self.callbacks.on_connection {
                callback(self);
            }
        }
        self.channel.remove();
        event_loop.unregister_connection(self.id());
        debug!(name = %self.name(), "connection destroyed");
    }

    pub fn is_channel_registered(&self) -> bool {
        self.channel.is_registered()
    }

    pub fn is_reading(&self) -> bool {
        self.channel.is_reading()
    }

    pub fn is_writing(&self) -> bool {
        self.channel.is_writing()
    }

    /// Stops watching the socket for input; bytes sent by the peer wait in the kernel
    /// until [`start_reading`](Self::start_reading). Loop thread only.
    pub fn stop_reading(&self) {
        if self.connected() && self.channel.is_reading() {
            trace!(name = %self.name(), "stop reading");
            self.channel.disable_reading();
        }
    }

    pub fn start_reading(&self) {
        if self.connected() && !self.channel.is_reading() {
            trace!(name = %self.name(), "start reading");
            self.channel.enable_reading(self.options.edge_triggered);
        }
    }

    /// Queues `data` for the peer. Must be called on the loop thread; use
    /// [`ConnectionHandle::send`] from elsewhere.
    pub fn send(self: &Rc<Self>, data: &[u8]) {
        assert!(self.shared.loop_handle.is_in_loop_thread(), "Connection::send on {} called outside its loop thread", self.name());

        if !self.connected() || self.write_closed.get() {
            warn!(name = %self.name(), "disconnected, give up writing");
            return;
        }

        let mut written = 0;
        if !self.channel.is_writing() && self.output.borrow().is_empty() && self.pending_files.borrow().is_empty() {
            match (&self.stream).write(data) {
                Ok(n) => {
                    written = n;
                    self.last_active.set(Instant::now());
                    trace!(name = %self.name(), written = n, "direct write");
                    if n == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                Err(e) => {
                    // the pending read or error event closes the connection
                    error!(name = %self.name(), cause = %e, "write failed");
                    return;
                }
            }
        }

        let remaining = &data[written..];
        if remaining.is_empty() {
            return;
        }

        {
            let mut files = self.pending_files.borrow_mut();
            match files.back_mut() {
                Some(segment) => segment.trailing.append(remaining),
                None => self.output.borrow_mut().append(remaining),
            }
        }

        let queued = self.queued_bytes();
        if queued >= self.options.high_water_mark {
            if let Some(callback) = &self.callbacks.on_high_water_mark {
                callback(self, queued);
            }
        }
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    /// Sends `len` bytes of `file` starting at `offset` with `sendfile(2)`.
    pub fn send_file(self: &Rc<Self>, file: File, offset: u64, len: u64) {
        if !self.connected() || self.write_closed.get() {
            warn!(name = %self.name(), "disconnected, give up sending file");
            return;
        }
        if len == 0 {
            return;
        }

        self.pending_files.borrow_mut().push_back(FileSegment { file, offset, remaining: len, trailing: Buffer::with_capacity(0) });
        if self.channel.is_writing() {
            return;
        }

        match self.write_pending() {
            WriteProgress::Drained => self.queue_write_complete(),
            WriteProgress::Blocked => self.channel.enable_writing(),
            WriteProgress::Failed(e) => {
                error!(name = %self.name(), cause = %e, "sendfile failed");
                self.handle_close();
            }
        }
    }

    /// Half-closes the write side, right away or once pending output drains.
    pub fn shutdown(self: &Rc<Self>) {
        if !self.connected() || self.write_closed.replace(true) {
            return;
        }
        if self.channel.is_writing() || !self.pending_files.borrow().is_empty() {
            self.shutdown_pending.set(true);
        } else {
            self.shutdown_write();
        }
    }

    /// Closes now, dropping whatever is still queued.
    pub fn force_close(self: &Rc<Self>) {
        if self.connected() {
            self.handle_close();
        }
    }

    fn shutdown_write(&self) {
        debug!(name = %self.name(), "shutdown write side");
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            warn!(name = %self.name(), cause = %e, "shutdown failed");
        }
    }

    fn queued_bytes(&self) -> usize {
        self.output.borrow().readable_bytes() + self.pending_files.borrow().iter().map(|s| s.trailing.readable_bytes()).sum::<usize>()
    }

    fn queue_write_complete(&self) {
        if self.callbacks.on_write_complete.is_none() {
            return;
        }
        let id = self.id();
        self.shared.loop_handle.queue_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                if let Some(callback) = &conn.callbacks.on_write_complete {
                    callback(&conn);
                }
            }
        });
    }

    fn handle_read(self: &Rc<Self>) {
        let mut total = 0;
        let mut eof = false;
        let mut failure = None;

        loop {
            let result = self.input.borrow_mut().read_from(&mut &self.stream);
            match result {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.options.edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if total > 0 {
            trace!(name = %self.name(), read = total, "read bytes");
            self.last_active.set(Instant::now());
            if let Some(callback) = &self.callbacks.on_message {
                callback(self);
            }
        }

        if let Some(e) = failure {
            debug!(name = %self.name(), cause = %e, "read failed");
            self.handle_close();
        } else if eof {
            trace!(name = %self.name(), "peer closed");
            self.handle_close();
        }
    }

    fn handle_write(self: &Rc<Self>) {
        if !self.channel.is_writing() {
            trace!(name = %self.name(), "connection is down, no more writing");
            return;
        }

        match self.write_pending() {
            WriteProgress::Drained => {
                self.channel.disable_writing();
                self.queue_write_complete();
                if self.shutdown_pending.replace(false) {
                    self.shutdown_write();
                }
            }
            WriteProgress::Blocked => {}
            WriteProgress::Failed(e) => {
                error!(name = %self.name(), cause = %e, "write failed");
                self.handle_close();
            }
        }
    }

    /// Writes the outbound buffer and file segments until done or the socket is full.
    fn write_pending(&self) -> WriteProgress {
        loop {
            {
                let mut output = self.output.borrow_mut();
                while !output.is_empty() {
                    match (&self.stream).write(output.peek()) {
                        Ok(n) => {
                            output.retrieve(n);
                            self.last_active.set(Instant::now());
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::Blocked,
                        Err(e) => return WriteProgress::Failed(e),
                    }
                }
            }

            let mut files = self.pending_files.borrow_mut();
            let Some(segment) = files.front_mut() else {
                return WriteProgress::Drained;
            };
            match segment.transfer(self.fd()) {
                Ok(true) => {
                    self.last_active.set(Instant::now());
                    if let Some(done) = files.pop_front() {
                        self.output.borrow_mut().append(done.trailing.peek());
                    }
                }
                Ok(false) => return WriteProgress::Blocked,
                Err(e) => return WriteProgress::Failed(e),
            }
        }
    }

    /// Tears the connection down. Safe to call more than once.
    pub(crate) fn handle_close(self: &Rc<Self>) {
        if self.state() == ConnState::Closed {
            return;
        }
        debug!(name = %self.name(), state = ?self.state(), "connection close");
        self.shared.set_state(ConnState::Closed);
        self.channel.disable_all();
        if let Some(event_loop) = EventLoop::current() {
            self.cancel_idle_timer(&event_loop);
        }

        if let Some(callback) = &self.callbacks.on_connection {
            callback(self);
        }
        if let Some(callback) = &self.callbacks.on_close {
            callback(self);
        }
        let delete = self.delete_callback.borrow_mut().take();
        if let Some(delete) = delete {
            delete(self);
        }
    }

    fn handle_error(self: &Rc<Self>) {
        let err = sys::socket_error(self.fd());
        error!(name = %self.name(), cause = %err, "connection error");
        if let Some(callback) = &self.callbacks.on_error {
            callback(self);
        }
        self.handle_close();
    }

    fn schedule_idle_check(self: &Rc<Self>, event_loop: &EventLoop, delay: Duration) {
        let Some(timeout) = self.options.idle_timeout else {
            return;
        };
        let weak = Rc::downgrade(self);
        let timer = event_loop.run_after(delay, move |event_loop| {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if !conn.connected() {
                return;
            }
            let idle = conn.last_active.get().elapsed();
            if idle >= timeout {
                debug!(name = %conn.name(), idle_ms = idle.as_millis(), "idle timeout, close");
                conn.idle_timer.set(None);
                conn.force_close();
            } else {
                conn.schedule_idle_check(event_loop, timeout - idle);
            }
        });
        self.idle_timer.set(Some(timer));
    }

    fn cancel_idle_timer(&self, event_loop: &EventLoop) {
        if let Some(timer) = self.idle_timer.take() {
            event_loop.cancel(timer);
        }
    }

    #[cfg(test)]
    pub(crate) fn close_for_test(self: &Rc<Self>) {
        self.handle_close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(name = %self.shared.name, fd = self.shared.fd, state = ?self.state(), "connection dropped");
    }
}

/// A thread safe reference to a connection living on some loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(shared: Arc<ConnShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.shared.loop_handle
    }

    /// Runs `f` with the connection on its loop, if it still exists there.
    pub fn run_in_loop(&self, f: impl FnOnce(&Rc<Connection>) + Send + 'static) {
        let id = self.id();
        self.shared.loop_handle.run_in_loop(move |event_loop| match event_loop.connection(id) {
            Some(conn) => f(&conn),
            None => trace!(conn = id, "connection is gone, skip task"),
        });
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        self.run_in_loop(move |conn| conn.send(&data));
    }

    pub fn shutdown(&self) {
        self.run_in_loop(|conn| conn.shutdown());
    }

    pub fn force_close(&self) {
        self.run_in_loop(|conn| conn.force_close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn handle_close_twice_deletes_once() {
        let event_loop = EventLoop::new();
        let (server, _client) = socket_pair();

        let closes = Arc::new(AtomicUsize::new(0));
        let callbacks = Callbacks {
            on_close: Some({
                let closes = Arc::clone(&closes);
                Arc::new(move |_conn: &Rc<Connection>| {
                    closes.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..Callbacks::default()
        };
        let conn = Connection::from_stream(&event_loop, 1, server, callbacks, ConnectionOptions::default()).unwrap();

        let deletes = Rc::new(Cell::new(0));
        {
            let deletes = Rc::clone(&deletes);
            conn.set_delete_callback(move |_| deletes.set(deletes.get() + 1));
        }
        conn.connection_established(&event_loop);
        assert!(conn.connected());
        assert!(conn.is_channel_registered());

        conn.close_for_test();
        conn.close_for_test();

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(deletes.get(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!conn.is_reading());

        conn.connection_destroyed(&event_loop);
        assert!(!conn.is_channel_registered());
        assert!(event_loop.connection(1).is_none());
    }

    #[test]
    fn stop_reading_leaves_input_in_the_socket() {
        let event_loop = EventLoop::new();
        let (server, mut client) = socket_pair();

        let callbacks = Callbacks {
            on_message: Some(Arc::new(|conn: &Rc<Connection>| {
                // one message at a time, the next one waits until this is answered
                conn.stop_reading();
                let data = conn.input().retrieve_all_as_string();
                let handle = conn.handle();
                conn.loop_handle().run_after(Duration::from_millis(50), move |event_loop| {
                    if let Some(conn) = event_loop.connection(handle.id()) {
                        conn.send(data.as_bytes());
                        conn.start_reading();
                    }
                });
            })),
            ..Callbacks::default()
        };
        let conn = Connection::from_stream(&event_loop, 9, server, callbacks, ConnectionOptions::default()).unwrap();
        {
            let event_loop = event_loop.clone();
            conn.set_delete_callback(move |_| event_loop.quit());
        }
        conn.connection_established(&event_loop);
        assert!(conn.is_reading());

        let peer = std::thread::spawn(move || {
            client.write_all(b"first").unwrap();
            let mut echoed = [0u8; 5];
            client.read_exact(&mut echoed).unwrap();
            client.write_all(b"again").unwrap();
            client.read_exact(&mut echoed).unwrap();
            drop(client);
            echoed
        });

        let paused = Rc::new(Cell::new(false));
        {
            let paused = Rc::clone(&paused);
            let conn = Rc::clone(&conn);
            event_loop.run_every(Duration::from_millis(5), move |_| {
                if conn.connected() && !conn.is_reading() {
                    paused.set(true);
                }
            });
        }
        event_loop.run();

        assert_eq!(&peer.join().unwrap(), b"again");
        assert!(paused.get());
        assert_eq!(conn.state(), ConnState::Closed);
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn echo_until_peer_closes() {
        let event_loop = EventLoop::new();
        let (server, mut client) = socket_pair();

        let callbacks = Callbacks {
            on_message: Some(Arc::new(|conn: &Rc<Connection>| {
                let data = conn.input().retrieve_all_as_string();
                conn.send(data.as_bytes());
            })),
            ..Callbacks::default()
        };
        let conn = Connection::from_stream(&event_loop, 7, server, callbacks, ConnectionOptions::default()).unwrap();
        {
            let event_loop = event_loop.clone();
            conn.set_delete_callback(move |_| event_loop.quit());
        }
        conn.connection_established(&event_loop);

        let peer = std::thread::spawn(move || {
            client.write_all(b"hello reactor").unwrap();
            let mut echoed = [0u8; 13];
            client.read_exact(&mut echoed).unwrap();
            drop(client);
            echoed
        });
        event_loop.run();

        assert_eq!(&peer.join().unwrap(), b"hello reactor");
        assert_eq!(conn.state(), ConnState::Closed);
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn shutdown_waits_for_pending_output() {
        let event_loop = EventLoop::new();
        let (server, mut client) = socket_pair();
        let conn = Connection::from_stream(&event_loop, 3, server, Callbacks::default(), ConnectionOptions::default()).unwrap();
        {
            let event_loop = event_loop.clone();
            conn.set_delete_callback(move |_| event_loop.quit());
        }
        conn.connection_established(&event_loop);

        // bigger than any socket buffer, so part of it must wait for writable events
        let payload: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        conn.send(&payload);
        conn.shutdown();
        conn.send(b"dropped after shutdown");

        let expected = payload.clone();
        let peer = std::thread::spawn(move || {
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            drop(client);
            received == expected
        });
        event_loop.run();

        assert!(peer.join().unwrap());
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn send_file_keeps_stream_order() {
        let event_loop = EventLoop::new();
        let (server, mut client) = socket_pair();
        let conn = Connection::from_stream(&event_loop, 4, server, Callbacks::default(), ConnectionOptions::default()).unwrap();
        {
            let event_loop = event_loop.clone();
            conn.set_delete_callback(move |_| event_loop.quit());
        }
        conn.connection_established(&event_loop);

        let path = std::env::temp_dir().join(format!("ember-net-sendfile-{}", std::process::id()));
        std::fs::write(&path, b"0123456789abcdefghij").unwrap();
        let file = File::open(&path).unwrap();

        conn.send(b"head:");
        conn.send_file(file, 5, 10);
        conn.send(b":tail");
        conn.shutdown();

        let peer = std::thread::spawn(move || {
            let mut received = String::new();
            client.read_to_string(&mut received).unwrap();
            received
        });
        event_loop.run();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(peer.join().unwrap(), "head:56789abcde:tail");
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn high_water_mark_reports_queued_bytes() {
        let event_loop = EventLoop::new();
        let (server, _client) = socket_pair();
        let marks = Arc::new(Mutex::new(Vec::new()));
        let callbacks = Callbacks {
            on_high_water_mark: Some({
                let marks = Arc::clone(&marks);
                Arc::new(move |_conn: &Rc<Connection>, queued: usize| marks.lock().unwrap().push(queued))
            }),
            ..Callbacks::default()
        };
        let options = ConnectionOptions { high_water_mark: 1024, ..ConnectionOptions::default() };
        let conn = Connection::from_stream(&event_loop, 5, server, callbacks, options).unwrap();
        conn.connection_established(&event_loop);

        // the peer never reads, so the socket buffers fill up and the rest queues
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..64 {
            conn.send(&chunk);
            if !marks.lock().unwrap().is_empty() {
                break;
            }
        }
        assert!(conn.output_bytes() > 0);
        assert!(conn.is_writing());

        let marks = marks.lock().unwrap();
        assert!(!marks.is_empty());
        assert!(marks.iter().all(|queued| *queued >= 1024));
        drop(marks);

        conn.force_close();
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn idle_connection_is_closed() {
        let event_loop = EventLoop::new();
        let (server, _client) = socket_pair();
        let options = ConnectionOptions { idle_timeout: Some(Duration::from_millis(30)), ..ConnectionOptions::default() };
        let conn = Connection::from_stream(&event_loop, 6, server, Callbacks::default(), options).unwrap();
        {
            let event_loop = event_loop.clone();
            conn.set_delete_callback(move |_| event_loop.quit());
        }
        conn.connection_established(&event_loop);

        let started = Instant::now();
        event_loop.run();

        assert_eq!(conn.state(), ConnState::Closed);
        assert!(started.elapsed() >= Duration::from_millis(30));
        conn.connection_destroyed(&event_loop);
    }

    #[test]
    fn context_is_typed() {
        let event_loop = EventLoop::new();
        let (server, _client) = socket_pair();
        let conn = Connection::from_stream(&event_loop, 8, server, Callbacks::default(), ConnectionOptions::default()).unwrap();

        assert!(!conn.has_context());
        conn.set_context(41u32);
        assert!(conn.context::<String>().is_none());
        *conn.context::<u32>().unwrap() += 1;
        assert!(conn.take_context::<String>().is_none());
        assert_eq!(conn.take_context::<u32>(), Some(42));
        assert!(!conn.has_context());
    }
}
