//! End-to-end echo scenarios over the full server stack.

mod common;

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use reverb::{InetAddress, LoopThread, ServerConfig, TcpConnectionPtr, TcpServer};

/// Base loop on its own thread plus the server bound to an ephemeral port.
/// Field order matters: the server must shut down before its base loop.
struct EchoFixture {
    server: TcpServer,
    _base: LoopThread,
    port: u16,
}

fn echo_fixture(threads: usize) -> EchoFixture {
    common::init_logging();
    let mut base = LoopThread::new(None, "test-base");
    let handle = base.start_loop();

    let server = TcpServer::new(&handle, &InetAddress::localhost(0), "echo", false);
    server.set_thread_num(threads);
    server.set_message_callback(Arc::new(|conn, input, _ts| {
        let data = input.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    let port = server.listen_addr().unwrap().port();

    EchoFixture {
        server,
        _base: base,
        port,
    }
}

#[test]
fn echo_round_trip_with_three_workers() {
    let fixture = echo_fixture(3);
    let disconnects = Arc::new(AtomicUsize::new(0));
    let seen = disconnects.clone();
    fixture
        .server
        .set_connection_callback(Arc::new(move |conn| {
            if !conn.connected() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

    let mut client = common::connect(fixture.port);
    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(client);
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            disconnects.load(Ordering::SeqCst) == 1
        }),
        "server never observed the disconnect"
    );
}

#[test]
fn cross_thread_sends_arrive_complete_and_in_order() {
    let fixture = echo_fixture(1);
    let (conn_tx, conn_rx) = mpsc::channel::<TcpConnectionPtr>();
    let conn_tx = Mutex::new(conn_tx);
    fixture
        .server
        .set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let _ = conn_tx.lock().send(conn.clone());
            }
        }));

    let mut client = common::connect(fixture.port);
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!conn.owner_loop().is_in_loop_thread());

    // An application thread, not an I/O loop.
    let sender = thread::spawn(move || {
        for _ in 0..1000 {
            conn.send(b"x");
        }
    });

    let mut received = vec![0u8; 1000];
    client.read_exact(&mut received).unwrap();
    assert!(received.iter().all(|&b| b == b'x'));
    sender.join().unwrap();
}

#[test]
fn concurrent_senders_keep_their_payloads_contiguous() {
    const BLOCK: usize = 1000;
    const SENDERS: usize = 4;

    let fixture = echo_fixture(1);
    let (conn_tx, conn_rx) = mpsc::channel::<TcpConnectionPtr>();
    let conn_tx = Mutex::new(conn_tx);
    fixture
        .server
        .set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let _ = conn_tx.lock().send(conn.clone());
            }
        }));

    let mut client = common::connect(fixture.port);
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let senders: Vec<_> = (0..SENDERS)
        .map(|i| {
            let conn = conn.clone();
            thread::spawn(move || {
                let block = vec![b'a' + i as u8; BLOCK];
                conn.send(&block);
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let mut received = vec![0u8; BLOCK * SENDERS];
    client.read_exact(&mut received).unwrap();

    // Each send is one loop task, so every sender's block lands intact.
    let mut seen = HashSet::new();
    for chunk in received.chunks(BLOCK) {
        assert!(chunk.iter().all(|&b| b == chunk[0]), "interleaved payloads");
        seen.insert(chunk[0]);
    }
    assert_eq!(seen.len(), SENDERS);
}

#[test]
fn connection_stays_on_one_loop() {
    let fixture = echo_fixture(3);
    let threads_seen = Arc::new(Mutex::new(HashSet::new()));
    let invocations = Arc::new(AtomicUsize::new(0));

    let seen = threads_seen.clone();
    let count = invocations.clone();
    fixture
        .server
        .set_message_callback(Arc::new(move |conn, input, _ts| {
            seen.lock().insert(thread::current().id());
            count.fetch_add(1, Ordering::SeqCst);
            let data = input.retrieve_all_as_bytes();
            conn.send(&data);
        }));

    let mut client = common::connect(fixture.port);
    let mut echoed = [0u8; 4];
    for _ in 0..10 {
        client.write_all(b"tick").unwrap();
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"tick");
    }

    assert!(invocations.load(Ordering::SeqCst) >= 2);
    assert_eq!(threads_seen.lock().len(), 1, "connection hopped loops");
}

#[test]
fn server_built_from_config() {
    common::init_logging();
    let config: ServerConfig = toml::from_str(
        r#"
            listen = "127.0.0.1:0"
            threads = 2
        "#,
    )
    .unwrap();

    let mut base = LoopThread::new(None, "cfg-base");
    let handle = base.start_loop();
    let server = TcpServer::new(
        &handle,
        &config.listen_addr().unwrap(),
        "cfg-echo",
        config.reuse_port,
    );
    server.set_thread_num(config.threads);
    server.set_message_callback(Arc::new(|conn, input, _ts| {
        let data = input.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();

    let mut client = common::connect(server.listen_addr().unwrap().port());
    client.write_all(b"cfg").unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"cfg");
}
