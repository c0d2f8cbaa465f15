//! Callback type aliases shared across the library.

use std::sync::Arc;
use std::time::Instant;

use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

/// Shared handle to a connection; kept alive by the server registry and any
/// in-flight loop task that refers to it.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on connection up and connection down.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when inbound bytes are available; the buffer is the connection's
/// input buffer, the timestamp is the poll-return time of the iteration that
/// delivered the data.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Invoked once per fully drained send-chain, from the loop's task phase.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when the output buffer crosses the high-water mark upward; the
/// second argument is the buffered byte count after the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Invoked with each worker loop (or the base loop when the pool is empty)
/// before it starts serving.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Library-internal: funnels a closing connection back into the server.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Library-internal: hands a freshly accepted socket to the server.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send>;

/// A unit of deferred work executed on a loop's task phase.
pub(crate) type Task = Box<dyn FnOnce() + Send>;
