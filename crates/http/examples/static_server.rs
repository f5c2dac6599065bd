//! Serves a directory on 127.0.0.1:8080.
//!
//! ```text
//! cargo run --example static_server -- ./public 8080
//! curl -H 'Range: bytes=0-99' http://127.0.0.1:8080/index.html
//! curl http://127.0.0.1:8080/delay
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use ember_http::{DeferredResponder, HttpServer, HttpServerOptions, StaticFileHandler};
use ember_net::EventLoop;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let root = args.next().unwrap_or_else(|| ".".to_string());
    let port = args.next().and_then(|port| port.parse().ok()).unwrap_or(8080);

    let event_loop = EventLoop::new();
    let options = HttpServerOptions::new().name("static-server").thread_num(4);
    let server = match HttpServer::new(&event_loop, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), options) {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };

    let handler = StaticFileHandler::new(&root);
    server.set_http_callback(move |conn, request, response| {
        if request.path() != "/delay" {
            return handler.handle(request, response);
        }

        // answered from another thread a little later
        let responder = DeferredResponder::new(conn);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            responder.send(|response| response.set_body("finally\n"));
        });
        false
    });

    if let Err(e) = server.start() {
        error!(cause = %e, "start server error");
        return;
    }
    info!(port, root = %root, "start listening");
    event_loop.run();
}
