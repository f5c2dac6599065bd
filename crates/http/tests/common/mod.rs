#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::io::{BufRead, BufReader, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ember_http::{HttpServer, HttpServerOptions};
use ember_net::EventLoop;

/// Runs `server` on this thread until `client` returns, then tears everything down.
/// A panic in `client` fails the test.
pub fn run_with_client(server: HttpServer, event_loop: &EventLoop, client: impl FnOnce(SocketAddr) + Send + 'static) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let server = Rc::new(server);

    let done = Arc::new(AtomicBool::new(false));
    let client = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let _done = DoneGuard(done);
            client(addr);
        })
    };

    {
        let server = Rc::clone(&server);
        event_loop.run_every(Duration::from_millis(10), move |event_loop| {
            if done.load(Ordering::SeqCst) && server.server().connection_count() == 0 {
                event_loop.quit();
            }
        });
    }
    event_loop.run_after(Duration::from_secs(10), EventLoop::quit);
    event_loop.run();

    client.join().unwrap();
}

pub fn local_server(event_loop: &EventLoop, options: HttpServerOptions) -> HttpServer {
    HttpServer::new(event_loop, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), options).unwrap()
}

struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Response {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

pub fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    BufReader::new(stream)
}

/// Reads one response; the body is read by `Content-Length` unless `head_only`.
pub fn read_response(reader: &mut BufReader<TcpStream>, head_only: bool) -> Response {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status_line = status_line.trim_end().to_string();
    assert!(status_line.starts_with("HTTP/1.1 "), "unexpected status line: {status_line:?}");

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut response = Response { status_line, headers, body: Vec::new() };
    if !head_only {
        let len: usize = response.header("Content-Length").unwrap().parse().unwrap();
        response.body = vec![0; len];
        reader.read_exact(&mut response.body).unwrap();
    }
    response
}

/// True once the peer has closed its side and nothing else arrives.
pub fn at_eof(reader: &mut BufReader<TcpStream>) -> bool {
    let mut rest = Vec::new();
    matches!(reader.read_to_end(&mut rest), Ok(0))
}
