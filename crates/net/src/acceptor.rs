//! Listening socket plus the channel that watches it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::channel::Channel;
use crate::error::NetError;
use crate::event_loop::EventLoop;

/// How long accepting pauses after an error such as `EMFILE`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Called with the accepted socket, its local address and the peer address.
pub type NewConnectionCallback = Rc<dyn Fn(TcpStream, SocketAddr, SocketAddr)>;

/// Accepts connections on the loop that created it.
///
/// The listening socket is non-blocking with `SO_REUSEADDR` set and is
/// watched level-triggered, so one connection is accepted per readiness event
/// and a backlog keeps the channel readable until it is drained. When
/// `accept` fails for another reason, such as running out of descriptors,
/// the pending connection cannot be taken off the backlog, so the socket is
/// left unwatched for [`ACCEPT_BACKOFF`] instead of spinning on it.
pub struct Acceptor {
    listener: TcpListener,
    channel: Rc<Channel>,
    listening: Cell<bool>,
    new_connection: RefCell<Option<NewConnectionCallback>>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor").field("listener", &self.listener).field("listening", &self.listening.get()).finish_non_exhaustive()
    }
}

impl Acceptor {
    pub fn bind(event_loop: &EventLoop, addr: SocketAddrV4) -> Result<Rc<Self>, NetError> {
        // std sets SO_REUSEADDR on unix listeners before binding
        let listener = TcpListener::bind(addr).map_err(|e| NetError::bind(addr, e))?;
        listener.set_nonblocking(true)?;

        let channel = Channel::new(event_loop.downgrade(), listener.as_raw_fd());
        Ok(Rc::new(Self { listener, channel, listening: Cell::new(false), new_connection: RefCell::new(None) }))
    }

    pub fn set_new_connection_callback(&self, callback: impl Fn(TcpStream, SocketAddr, SocketAddr) + 'static) {
        *self.new_connection.borrow_mut() = Some(Rc::new(callback));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// Starts watching the listening socket. Must be called on the loop thread.
    pub fn listen(self: &Rc<Self>) {
        if self.listening.replace(true) {
            return;
        }

        let weak = Rc::downgrade(self);
        self.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        self.channel.enable_reading(false);

        if let Ok(addr) = self.local_addr() {
            info!(%addr, "start listening");
        }
    }

    fn handle_read(self: &Rc<Self>) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = Self::prepare(&stream) {
                    error!(%peer, cause = %e, "failed to prepare accepted socket");
                    return;
                }
                let local = match stream.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        error!(%peer, cause = %e, "failed to get local address");
                        return;
                    }
                };
                trace!(fd = stream.as_raw_fd(), %peer, "accepted");

                let callback = self.new_connection.borrow().clone();
                match callback {
                    Some(callback) => callback(stream, local, peer),
                    None => debug!(%peer, "no new connection callback, drop the socket"),
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted) => {}
            Err(e) => self.back_off(&e),
        }
    }

    fn back_off(self: &Rc<Self>, cause: &io::Error) {
        error!(%cause, backoff = ?ACCEPT_BACKOFF, "failed to accept, pause accepting");
        if !self.channel.is_reading() {
            return;
        }
        let Some(event_loop) = EventLoop::current() else {
            return;
        };
        self.channel.disable_reading();

        let weak = Rc::downgrade(self);
        event_loop.run_after(ACCEPT_BACKOFF, move |_| {
            if let Some(acceptor) = weak.upgrade() {
                info!("resume accepting");
                acceptor.channel.enable_reading(false);
            }
        });
    }

    fn prepare(stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
