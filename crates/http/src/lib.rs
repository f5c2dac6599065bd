//! HTTP/1.x serving on the `ember-net` reactors.
//!
//! Requests are parsed incrementally as bytes arrive on a connection, handed
//! to one callback on the connection's loop thread, and answered in order.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining
//! - `Content-Length` and chunked request bodies
//! - Configurable limits on lines, headers and bodies
//! - Deferred responses, finished later from any thread
//! - Single byte ranges and a static file handler using `sendfile(2)`
//!
//! # Example
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! use ember_http::{HttpServer, HttpServerOptions};
//! use ember_net::EventLoop;
//! use http::StatusCode;
//!
//! let event_loop = EventLoop::new();
//! let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
//! let server = HttpServer::new(&event_loop, addr, HttpServerOptions::new().thread_num(4)).unwrap();
//!
//! server.set_http_callback(|_conn, request, response| {
//!     match request.path() {
//!         "/hello" => response.set_body("hello world"),
//!         _ => response.set_status(StatusCode::NOT_FOUND),
//!     }
//!     true
//! });
//!
//! server.start().unwrap();
//! event_loop.run();
//! ```

pub mod codec;
pub mod protocol;
mod server;
mod static_files;
mod utils;

pub(crate) use utils::ensure;

pub use server::{DEFAULT_IDLE_TIMEOUT, DeferredResponder, HttpCallback, HttpServer, HttpServerOptions, http_context};
pub use static_files::StaticFileHandler;
