//! Accept-side fd exhaustion must not crash or wedge the server.
//!
//! Lives in its own test binary: it lowers `RLIMIT_NOFILE` for the whole
//! process.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reverb::{InetAddress, LoopThread, TcpServer};

struct RlimitGuard {
    original: libc::rlimit,
}

impl RlimitGuard {
    fn lower_to(limit: u64) -> Self {
        let mut original: libc::rlimit = unsafe { std::mem::zeroed() };
        unsafe {
            assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut original), 0);
            let lowered = libc::rlimit {
                rlim_cur: limit,
                rlim_max: original.rlim_max,
            };
            assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &lowered), 0);
        }
        Self { original }
    }
}

impl Drop for RlimitGuard {
    fn drop(&mut self) {
        unsafe {
            libc::setrlimit(libc::RLIMIT_NOFILE, &self.original);
        }
    }
}

#[test]
fn keeps_accepting_after_fd_exhaustion() {
    common::init_logging();

    let mut base = LoopThread::new(None, "emfile-base");
    let handle = base.start_loop();

    let server = TcpServer::new(&handle, &InetAddress::localhost(0), "emfile", false);
    server.set_message_callback(Arc::new(|conn, input, _ts| {
        let data = input.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    let port = server.listen_addr().unwrap().port();

    // Sanity: the server echoes before the squeeze.
    {
        let mut client = common::connect(port);
        client.write_all(b"before").unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"before");
    }

    let guard = RlimitGuard::lower_to(64);

    // Open connections until the process (client or server side) runs dry;
    // the server sheds what it cannot take.
    let mut hoard = Vec::new();
    for _ in 0..128 {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => hoard.push(stream),
            Err(_) => break,
        }
    }
    thread::sleep(Duration::from_millis(300));

    // Free everything and verify the server recovered.
    drop(hoard);
    drop(guard);
    thread::sleep(Duration::from_millis(100));

    let mut client = common::connect(port);
    client.write_all(b"after").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"after");
}
