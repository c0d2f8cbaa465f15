#![allow(dead_code)]

use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Connect to the local server, retrying briefly: `start()` posts the
/// listen call to the base loop, so the socket may not be accepting in the
/// first few milliseconds.
pub fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    panic!("connect to 127.0.0.1:{port} failed: {e}");
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Spin until `predicate` holds or the timeout elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
