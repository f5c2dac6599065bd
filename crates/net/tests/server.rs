use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, ThreadId};
use std::time::Duration;

use ember_net::{ConnectionHandle, EventLoop, LoopHandle, Server, ServerOptions};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn local_any() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

#[test]
fn echo_and_cross_thread_teardown() {
    init_logging();
    let event_loop = EventLoop::new();
    let server = Rc::new(Server::new(&event_loop, local_any(), ServerOptions::new().name("echo").thread_num(2)).unwrap());

    let events: Arc<Mutex<Vec<(u64, bool, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        server.set_connection_callback(move |conn| {
            events.lock().unwrap().push((conn.id(), conn.connected(), thread::current().id()));
        });
    }
    server.set_message_callback(|conn| {
        let data = conn.input().retrieve_all_as_string();
        conn.send(data.as_bytes());
    });
    server.start().unwrap();

    let addr = server.local_addr().unwrap();
    let workers: HashSet<ThreadId> = server.worker_loops().iter().map(LoopHandle::thread_id).collect();
    assert_eq!(workers.len(), 2);

    let clients_done = Arc::new(AtomicBool::new(false));
    let clients = {
        let clients_done = Arc::clone(&clients_done);
        thread::spawn(move || {
            for i in 0..6 {
                let mut stream = TcpStream::connect(addr).unwrap();
                let message = format!("ping {i}");
                stream.write_all(message.as_bytes()).unwrap();
                let mut echoed = vec![0u8; message.len()];
                stream.read_exact(&mut echoed).unwrap();
                assert_eq!(echoed, message.as_bytes());
            }
            clients_done.store(true, Ordering::SeqCst);
        })
    };

    {
        let server = Rc::clone(&server);
        event_loop.run_every(Duration::from_millis(10), move |event_loop| {
            if clients_done.load(Ordering::SeqCst) && server.connection_count() == 0 {
                event_loop.quit();
            }
        });
    }
    event_loop.run_after(Duration::from_secs(10), EventLoop::quit);
    event_loop.run();
    clients.join().unwrap();

    assert_eq!(server.connection_count(), 0);

    let mut per_conn: HashMap<u64, Vec<(bool, ThreadId)>> = HashMap::new();
    for (id, up, thread) in events.lock().unwrap().iter() {
        per_conn.entry(*id).or_default().push((*up, *thread));
    }
    assert_eq!(per_conn.len(), 6);
    for transitions in per_conn.values() {
        assert_eq!(transitions.len(), 2);
        assert!(transitions[0].0);
        assert!(!transitions[1].0);
        // up and down happen on the same worker
        assert_eq!(transitions[0].1, transitions[1].1);
        assert!(workers.contains(&transitions[0].1));
    }

    // every worker has dropped its registrations
    for worker in server.worker_loops() {
        let (tx, rx) = mpsc::channel();
        worker.run_in_loop(move |event_loop| tx.send(event_loop.connection_count()).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }
}

#[test]
fn force_close_from_another_thread() {
    init_logging();
    let event_loop = EventLoop::new();
    let server = Server::new(&event_loop, local_any(), ServerOptions::new().thread_num(1)).unwrap();

    let handles: Arc<Mutex<Vec<ConnectionHandle>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let handles = Arc::clone(&handles);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                handles.lock().unwrap().push(conn.handle());
            }
        });
    }
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let main = event_loop.handle();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        main.quit();
        n
    });

    {
        let handles = Arc::clone(&handles);
        event_loop.run_every(Duration::from_millis(10), move |_| {
            let handles = handles.lock().unwrap();
            if let Some(handle) = handles.first() {
                assert!(!handle.loop_handle().is_in_loop_thread());
                handle.send(&b"bye"[..]);
                handle.force_close();
            }
        });
    }
    event_loop.run_after(Duration::from_secs(10), EventLoop::quit);
    event_loop.run();

    // either the goodbye or the close arrives first, never a timeout
    let n = client.join().unwrap();
    assert!(n == 0 || n == 3);
}

#[test]
fn single_threaded_server_runs_on_main_loop() {
    init_logging();
    let event_loop = EventLoop::new();
    let server = Server::new(&event_loop, local_any(), ServerOptions::new()).unwrap();
    let main_thread = thread::current().id();
    server.set_message_callback(move |conn| {
        assert_eq!(thread::current().id(), main_thread);
        let request = conn.input().retrieve_all_as_string();
        conn.send(request.to_uppercase().as_bytes());
        conn.shutdown();
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let main = event_loop.handle();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"shout").unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        main.quit();
        reply
    });
    event_loop.run_after(Duration::from_secs(10), EventLoop::quit);
    event_loop.run();

    assert_eq!(client.join().unwrap(), "SHOUT");
}
