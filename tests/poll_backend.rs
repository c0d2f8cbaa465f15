//! Echo over the `poll(2)` fallback backend.
//!
//! Lives in its own test binary so the environment variable is set before
//! any loop (and thus any poller) exists.

mod common;

use std::io::{Read, Write};
use std::sync::Arc;

use reverb::{InetAddress, LoopThread, TcpServer};

#[test]
fn echo_round_trip_over_poll_backend() {
    std::env::set_var("REVERB_USE_POLL", "1");
    common::init_logging();

    let mut base = LoopThread::new(None, "poll-base");
    let handle = base.start_loop();

    let server = TcpServer::new(&handle, &InetAddress::localhost(0), "poll-echo", false);
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, input, _ts| {
        let data = input.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();

    let mut client = common::connect(server.listen_addr().unwrap().port());
    client.write_all(b"fallback").unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"fallback");
}
