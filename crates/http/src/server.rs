//! HTTP on top of [`ember_net::Server`].
//!
//! Each connection carries an [`HttpContext`] in its context slot. Incoming
//! bytes are parsed as they arrive; every complete request goes to the HTTP
//! callback, pipelined requests are answered in order.
//!
//! The callback answers right away by returning `true`. Returning `false`
//! parks the response in the context until a [`DeferredResponder`] sends it;
//! requests pipelined behind it wait until then, and the connection stops
//! reading so they wait in the socket rather than in memory.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ember_net::{Connection, ConnectionHandle, EventLoop, NetError, Server, ServerOptions};
use http::{Method, StatusCode};
use tracing::{debug, trace, warn};

use crate::codec::{HttpContext, ParseLimits, encode};
use crate::protocol::{HttpRequest, HttpResponse, ParseError, ResponseBody};

/// Connections silent for this long are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Handles one request. Return `true` once `response` is ready to be sent,
/// `false` to finish it later through a [`DeferredResponder`].
pub type HttpCallback = Arc<dyn Fn(&Rc<Connection>, &HttpRequest, &mut HttpResponse) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    server: ServerOptions,
    limits: ParseLimits,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self { server: ServerOptions::new().name("ember-http").idle_timeout(Some(DEFAULT_IDLE_TIMEOUT)), limits: ParseLimits::default() }
    }
}

impl HttpServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.server = self.server.name(name);
        self
    }

    #[must_use]
    pub fn thread_num(mut self, thread_num: usize) -> Self {
        self.server = self.server.thread_num(thread_num);
        self
    }

    /// `None` keeps idle connections open.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.server = self.server.idle_timeout(idle_timeout);
        self
    }

    #[must_use]
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.server = self.server.high_water_mark(high_water_mark);
        self
    }

    #[must_use]
    pub fn edge_triggered(mut self, edge_triggered: bool) -> Self {
        self.server = self.server.edge_triggered(edge_triggered);
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ParseLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn get_limits(&self) -> &ParseLimits {
        &self.limits
    }

    pub fn server_options(&self) -> &ServerOptions {
        &self.server
    }
}

/// Shared by every connection of one server.
struct HttpService {
    limits: ParseLimits,
    callback: HttpCallback,
}

/// What lives in a connection's context slot.
struct HttpSession {
    context: HttpContext,
    service: Arc<HttpService>,
    // a close was answered, further input is discarded
    closing: bool,
}

pub struct HttpServer {
    server: Server,
    limits: ParseLimits,
    callback: RefCell<HttpCallback>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer").field("server", &self.server).field("limits", &self.limits).finish_non_exhaustive()
    }
}

impl HttpServer {
    pub fn new(event_loop: &EventLoop, addr: SocketAddrV4, options: HttpServerOptions) -> Result<Self, NetError> {
        let server = Server::new(event_loop, addr, options.server)?;
        let callback: HttpCallback = Arc::new(not_found);
        Ok(Self { server, limits: options.limits, callback: RefCell::new(callback) })
    }

    /// Replaces the default callback, which answers `404 Not Found` and closes.
    /// Takes effect for servers started afterwards.
    pub fn set_http_callback(&self, callback: impl Fn(&Rc<Connection>, &HttpRequest, &mut HttpResponse) -> bool + Send + Sync + 'static) {
        *self.callback.borrow_mut() = Arc::new(callback);
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// The underlying server, for thread init or close callbacks. Its connection and
    /// message callbacks belong to the HTTP layer.
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn start(&self) -> Result<(), NetError> {
        let service = Arc::new(HttpService { limits: self.limits, callback: Arc::clone(&self.callback.borrow()) });

        {
            let service = Arc::clone(&service);
            self.server.set_connection_callback(move |conn| {
                if conn.connected() {
                    debug!(name = %conn.name(), peer = %conn.peer_addr(), "new http connection");
                    conn.set_context(HttpSession { context: HttpContext::new(service.limits), service: Arc::clone(&service), closing: false });
                }
            });
        }
        self.server.set_message_callback(move |conn| process(&service, conn));
        self.server.start()
    }
}

/// The parser state of an HTTP connection, for use on its loop thread.
pub fn http_context(conn: &Rc<Connection>) -> Option<RefMut<'_, HttpContext>> {
    conn.context::<HttpSession>().map(|session| RefMut::map(session, |session| &mut session.context))
}

fn not_found(_conn: &Rc<Connection>, _request: &HttpRequest, response: &mut HttpResponse) -> bool {
    response.set_status(StatusCode::NOT_FOUND);
    response.set_close_connection(true);
    true
}

enum Step {
    Wait,
    Request(HttpRequest),
    Invalid(ParseError),
}

/// Parses and answers buffered requests until input runs out, a response is
/// deferred or the connection stops accepting requests.
fn process(service: &Arc<HttpService>, conn: &Rc<Connection>) {
    loop {
        if !conn.connected() {
            return;
        }

        let step = {
            let Some(mut session) = conn.context::<HttpSession>() else {
                return;
            };
            if session.closing {
                conn.input().retrieve_all();
                return;
            }
            if session.context.has_deferred() {
                // reading is paused meanwhile, only what arrived before the pause is buffered
                let buffered = conn.input().readable_bytes() as u64;
                if buffered > service.limits.max_request_bytes() {
                    drop(session);
                    warn!(name = %conn.name(), buffered, "too much input behind a deferred response, close connection");
                    conn.force_close();
                }
                return;
            }

            let mut input = conn.input();
            match session.context.parse(input.peek()) {
                Ok(consumed) => {
                    input.retrieve(consumed);
                    if session.context.is_complete() {
                        let request = session.context.take_request();
                        session.context.reset();
                        Step::Request(request)
                    } else {
                        Step::Wait
                    }
                }
                Err(e) => {
                    input.retrieve_all();
                    session.closing = true;
                    Step::Invalid(e)
                }
            }
        };

        match step {
            Step::Wait => return,
            Step::Invalid(e) => {
                warn!(name = %conn.name(), cause = %e, "bad request, close connection");
                conn.send(BAD_REQUEST);
                conn.shutdown();
                return;
            }
            Step::Request(request) => {
                if !on_request(service, conn, &request) {
                    return;
                }
            }
        }
    }
}

/// Returns whether the next pipelined request may be handled right away.
fn on_request(service: &HttpService, conn: &Rc<Connection>, request: &HttpRequest) -> bool {
    trace!(name = %conn.name(), method = %request.method(), path = request.path(), "dispatch request");

    let mut response = HttpResponse::new(!request.keep_alive());
    response.set_head_only(request.method() == Method::HEAD);

    if (service.callback)(conn, request, &mut response) {
        return write_response(conn, response);
    }

    match conn.context::<HttpSession>() {
        Some(mut session) => session.context.store_deferred(response),
        None => warn!(name = %conn.name(), "no http context, drop deferred response"),
    }
    // pipelined input waits in the kernel until the response is finished
    conn.stop_reading();
    false
}

/// Sends the response; returns false when the connection is closing afterwards.
fn write_response(conn: &Rc<Connection>, mut response: HttpResponse) -> bool {
    let mut buf = BytesMut::new();
    encode(&response, &mut buf);
    conn.send(&buf);

    if !response.head_only() {
        if let ResponseBody::File { file, offset, len } = response.take_body() {
            conn.send_file(file, offset, len);
        }
    }

    if response.close_connection() {
        if let Some(mut session) = conn.context::<HttpSession>() {
            session.closing = true;
        }
        conn.shutdown();
        return false;
    }
    true
}

/// Finishes a response the callback left pending by returning `false`.
///
/// Clonable and `Send`: it may be moved to another thread, the work is always
/// queued onto the connection's own loop.
#[derive(Debug, Clone)]
pub struct DeferredResponder {
    conn: ConnectionHandle,
}

impl DeferredResponder {
    pub fn new(conn: &Rc<Connection>) -> Self {
        Self { conn: conn.handle() }
    }

    /// Lets `fill` complete the pending response, sends it, then resumes with any
    /// requests that were pipelined behind it.
    pub fn send(self, fill: impl FnOnce(&mut HttpResponse) + Send + 'static) {
        self.finish(Some(fill));
    }

    /// Drops the pending response without answering and resumes parsing.
    pub fn clear(self) {
        self.finish(None::<fn(&mut HttpResponse)>);
    }

    fn finish<F: FnOnce(&mut HttpResponse) + Send + 'static>(self, fill: Option<F>) {
        let id = self.conn.id();
        // queued even on the loop thread: the callback may still be running and has
        // not parked its response yet
        self.conn.loop_handle().queue_in_loop(move |event_loop| {
            let Some(conn) = event_loop.connection(id) else {
                trace!(conn = id, "connection is gone, drop deferred response");
                return;
            };

            let (response, service) = {
                let Some(mut session) = conn.context::<HttpSession>() else {
                    return;
                };
                (session.context.take_deferred(), Arc::clone(&session.service))
            };
            let Some(mut response) = response else {
                debug!(name = %conn.name(), "no deferred response pending");
                return;
            };
            conn.start_reading();

            if let Some(fill) = fill {
                fill(&mut response);
                if !conn.connected() || !write_response(&conn, response) {
                    return;
                }
            }
            process(&service, &conn);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_idle_close() {
        let options = HttpServerOptions::new();
        assert_eq!(options.server_options().get_name(), "ember-http");
        assert_eq!(options.get_limits(), &ParseLimits::default());

        let options = options.thread_num(4).limits(ParseLimits::new().max_headers(8));
        assert_eq!(options.server_options().get_thread_num(), 4);
        assert_eq!(options.get_limits().get_max_headers(), 8);
    }

    #[test]
    fn binds_on_new() {
        let event_loop = EventLoop::new();
        let addr = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0);
        let server = HttpServer::new(&event_loop, addr, HttpServerOptions::new().name("bind-test")).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.server().name(), "bind-test");
    }
}
