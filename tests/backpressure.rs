//! Output-buffer watermarks, write-complete signalling, and graceful close.

mod common;

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reverb::{InetAddress, LoopThread, TcpServer};

#[test]
fn high_water_mark_fires_once_then_write_complete() {
    const PAYLOAD: usize = 16 * 1024 * 1024;
    const MARK: usize = 1024 * 1024;

    common::init_logging();
    let mut base = LoopThread::new(None, "hwm-base");
    let handle = base.start_loop();

    let server = TcpServer::new(&handle, &InetAddress::localhost(0), "burst", false);
    server.set_thread_num(1);

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_total = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let payload = Arc::new(vec![0xabu8; PAYLOAD]);

    let completes = write_completes.clone();
    server.set_write_complete_callback(Arc::new(move |_conn| {
        completes.fetch_add(1, Ordering::SeqCst);
    }));

    let hits = hwm_hits.clone();
    let total = hwm_total.clone();
    let burst = payload.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let hits = hits.clone();
            let total = total.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, buffered| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    total.store(buffered, Ordering::SeqCst);
                }),
                MARK,
            );
            conn.send(&burst);
        }
    }));
    server.start();

    let mut client = common::connect(server.listen_addr().unwrap().port());
    // Stay off the socket briefly so the output buffer actually fills.
    thread::sleep(Duration::from_millis(100));

    let mut received = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    while received < PAYLOAD {
        let n = client.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "peer closed before the payload finished");
        assert!(chunk[..n].iter().all(|&b| b == 0xab));
        received += n;
    }
    assert_eq!(received, PAYLOAD);

    assert!(common::wait_until(Duration::from_secs(5), || {
        write_completes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1, "edge-trigger fired more than once");
    assert!(hwm_total.load(Ordering::SeqCst) >= MARK);
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_with_pending_output_drains_then_half_closes() {
    const PAYLOAD: usize = 4 * 1024 * 1024;

    common::init_logging();
    let mut base = LoopThread::new(None, "close-base");
    let handle = base.start_loop();

    let server = TcpServer::new(&handle, &InetAddress::localhost(0), "drain", false);
    server.set_thread_num(1);

    let downs = Arc::new(AtomicUsize::new(0));
    let payload = Arc::new(vec![0x5au8; PAYLOAD]);
    let seen = downs.clone();
    let burst = payload.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            conn.send(&burst);
            conn.shutdown();
        } else {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));
    server.start();

    let mut client = common::connect(server.listen_addr().unwrap().port());
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();

    // Everything queued before the shutdown arrives, then EOF.
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == 0x5a));

    drop(client);
    assert!(common::wait_until(Duration::from_secs(5), || {
        downs.load(Ordering::SeqCst) == 1
    }));
}
