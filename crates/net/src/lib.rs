//! A multi-reactor TCP runtime on top of linux epoll.
//!
//! One [`EventLoop`] runs per thread. A [`Server`] accepts on its main loop
//! and hands every connection to a worker loop from an
//! [`EventLoopThreadPool`], round robin. From then on the [`Connection`] is
//! only touched by that worker: reads land in its input [`Buffer`], the
//! message callback consumes them, and replies are written directly or queued
//! until the socket is writable again.
//!
//! # Example
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use ember_net::{EventLoop, Server, ServerOptions};
//! use tracing::{error, info};
//!
//! let event_loop = EventLoop::new();
//! let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
//! let server = match Server::new(&event_loop, addr, ServerOptions::new().name("echo").thread_num(4)) {
//!     Ok(server) => server,
//!     Err(e) => {
//!         error!(cause = %e, "bind server error");
//!         return;
//!     }
//! };
//!
//! server.set_message_callback(|conn| {
//!     let data = conn.input().retrieve_all_as_string();
//!     info!(len = data.len(), "echo");
//!     conn.send(data.as_bytes());
//! });
//! server.start().expect("start server");
//! event_loop.run();
//! ```
//!
//! # Threads
//!
//! Loop-local objects ([`EventLoop`], [`Connection`]) are `!Send`. Other
//! threads use [`LoopHandle`] and [`ConnectionHandle`], which schedule
//! closures onto the owning loop.

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod error;
mod event_loop;
mod poller;
mod server;
mod sys;
mod thread_pool;
mod timer;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use channel::Channel;
pub use connection::{
    Callbacks, ConnState, Connection, ConnectionCallback, ConnectionHandle, ConnectionOptions, DEFAULT_HIGH_WATER_MARK,
    HighWaterMarkCallback,
};
pub use error::NetError;
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use server::{Server, ServerOptions};
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
