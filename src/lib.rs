//! reverb: a multi-reactor TCP server library.
//!
//! One event loop per thread: a base loop accepts connections and hands
//! each one to a worker loop, which then owns all of that connection's I/O.
//! Applications register connection, message, write-complete, and
//! high-water callbacks and never touch the multiplexer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reverb::{EventLoop, InetAddress, TcpServer};
//!
//! let mut base_loop = EventLoop::new();
//! let server = TcpServer::new(
//!     &base_loop.handle(),
//!     &InetAddress::localhost(8002),
//!     "echo",
//!     false,
//! );
//! server.set_thread_num(3);
//! server.set_message_callback(Arc::new(|conn, input, _ts| {
//!     let data = input.retrieve_all_as_bytes();
//!     conn.send(&data);
//! }));
//! server.start();
//! base_loop.run();
//! ```
//!
//! Readiness is epoll by default; setting `REVERB_USE_POLL=1` opts into a
//! portable `poll(2)` backend.

mod acceptor;
mod addr;
mod buffer;
mod callbacks;
mod channel;
mod config;
mod connection;
mod event_loop;
mod loop_pool;
mod loop_thread;
mod poller;
mod server;
mod socket;

pub use acceptor::Acceptor;
pub use addr::InetAddress;
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionState, TcpConnection};
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_pool::LoopPool;
pub use loop_thread::LoopThread;
pub use server::TcpServer;
