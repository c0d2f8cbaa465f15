//! Per-connection state machine: buffered reads and writes, backpressure
//! signalling, graceful close.
//!
//! A connection is shared (`Arc`) between the server registry and any loop
//! task that touches it; its buffers and channel are only ever used from the
//! owning loop's thread. `send` and `shutdown` may be called from any
//! thread and hop onto the loop as needed.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle.
///
/// Transitions are monotonic: Connecting → Connected → Disconnecting →
/// Disconnected, with the direct Connected → Disconnected edge for a remote
/// close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::Disconnected,
            _ => ConnectionState::Connecting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnecting => 2,
            ConnectionState::Disconnected => 3,
        }
    }
}

pub struct TcpConnection {
    owner: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,

    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,

    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,

    high_water_mark: AtomicUsize,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wrap an accepted socket. The connection starts in `Connecting`;
    /// nothing is registered with the loop until `connect_established`.
    pub(crate) fn new(
        owner: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        socket.set_tcp_nodelay(true);
        socket.set_keepalive(true);

        let channel = Channel::new(owner.clone(), socket.fd());
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |ts| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(ts);
                }
            }));
            let w = weak.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            }));
            let w = weak.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            }));
            let w = weak.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            }));

            TcpConnection {
                owner,
                name,
                state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
                socket,
                channel: channel.clone(),
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                connection_callback: Mutex::new(None),
                message_callback: Mutex::new(None),
                write_complete_callback: Mutex::new(None),
                high_water_mark_callback: Mutex::new(None),
                close_callback: Mutex::new(None),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                weak_self: weak.clone(),
            }
        });
        debug!(name = %conn.name, fd = conn.channel.fd(), "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn local_address(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_address(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock() = Some(cb);
    }

    /// Queue `data` for delivery. Safe from any thread.
    ///
    /// Off-loop callers pay one copy: their slice may be gone before the
    /// loop gets to the write.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            debug!(name = %self.name, "send on a non-connected connection dropped");
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(conn) = self.weak_self.upgrade() {
            let owned = data.to_vec();
            self.owner.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Close the write direction once all queued output has drained.
    /// At most one transition; repeated calls are no-ops.
    pub fn shutdown(&self) {
        let connected = ConnectionState::Connected.as_u8();
        let disconnecting = ConnectionState::Disconnecting.as_u8();
        if self
            .state
            .compare_exchange(connected, disconnecting, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(conn) = self.weak_self.upgrade() {
                self.owner.run_in_loop(move || conn.shutdown_in_loop());
            }
        }
    }

    /// First act of the connection on its owner loop: arm the channel tie,
    /// start reading, announce connection-up.
    pub(crate) fn connect_established(&self) {
        self.owner.assert_in_loop_thread();
        self.set_state(ConnectionState::Connected);

        if let Some(conn) = self.weak_self.upgrade() {
            let tie: Arc<dyn Any + Send + Sync> = conn.clone();
            self.channel.tie(&tie);
            self.channel.enable_reading();

            let cb = self.connection_callback.lock().clone();
            if let Some(cb) = cb {
                cb(&conn);
            }
        }
        debug!(name = %self.name, peer = %self.peer_addr, "connection established");
    }

    /// Terminal teardown, always the last loop task touching the
    /// connection. Announces connection-down if the remote-close path has
    /// not already done so, then unregisters the channel.
    pub(crate) fn connect_destroyed(&self) {
        self.owner.assert_in_loop_thread();
        let prev = self
            .state
            .swap(ConnectionState::Disconnected.as_u8(), Ordering::AcqRel);

        if prev == ConnectionState::Connected.as_u8() {
            self.channel.disable_all();
            let cb = self.connection_callback.lock().clone();
            if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
                cb(&conn);
            }
        }
        self.channel.remove();
        debug!(name = %self.name, "connection destroyed");
    }

    fn state_is(&self, expected: ConnectionState) -> bool {
        self.state() == expected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Optimistic direct write, remainder into the output buffer.
    fn send_in_loop(&self, data: &[u8]) {
        self.owner.assert_in_loop_thread();
        if self.state_is(ConnectionState::Disconnected) {
            debug!(name = %self.name, "send after disconnect dropped");
            return;
        }

        let len = data.len();
        let mut nwrote = 0usize;
        let mut remaining = len;
        let mut fault = false;

        let mut out = self.output_buffer.lock();
        if !self.channel.is_writing() && out.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = len - n;
                    if remaining == 0 {
                        // Never synchronously: the user callback runs in the
                        // next task phase, after this call has returned.
                        self.queue_write_complete();
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "direct write failed");
                    fault = true;
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = out.readable_bytes();
            out.append(&data[nwrote..]);

            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < mark && old_len + remaining >= mark {
                let cb = self.high_water_mark_callback.lock().clone();
                if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
                    let total = old_len + remaining;
                    self.owner.queue_in_loop(move || cb(&conn, total));
                }
            }

            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.owner.assert_in_loop_thread();
        // With output still queued the half-close waits for handle_write to
        // drain it.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn handle_read(&self, receive_time: Instant) {
        debug_assert!(self.owner.is_in_loop_thread());
        let result = self.input_buffer.lock().read_from_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "inbound data");
                let cb = self.message_callback.lock().clone();
                if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
                    let mut input = self.input_buffer.lock();
                    cb(&conn, &mut input, receive_time);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        debug_assert!(self.owner.is_in_loop_thread());
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write readiness on idle channel ignored");
            return;
        }

        let mut out = self.output_buffer.lock();
        match out.write_to_fd(self.channel.fd()) {
            Ok(_n) => {
                if out.readable_bytes() == 0 {
                    drop(out);
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state_is(ConnectionState::Disconnecting) {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(name = %self.name, error = %e, "write failed"),
        }
    }

    /// Remote close or fatal transport error: exactly one connection-down
    /// callback, then hand the connection back to the server.
    fn handle_close(&self) {
        debug_assert!(self.owner.is_in_loop_thread());
        debug!(name = %self.name, state = ?self.state(), "connection closing");
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        if let Some(conn) = self.weak_self.upgrade() {
            let connection_cb = self.connection_callback.lock().clone();
            if let Some(cb) = connection_cb {
                cb(&conn);
            }
            let close_cb = self.close_callback.lock().clone();
            if let Some(cb) = close_cb {
                cb(&conn);
            }
        }
    }

    /// Surface the pending socket error; teardown is `handle_close`'s job.
    fn handle_error(&self) {
        match self.socket.socket_error() {
            Some(e) => error!(name = %self.name, error = %e, "socket error"),
            None => debug!(name = %self.name, "error event with no pending socket error"),
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.write_complete_callback.lock().clone();
        if let (Some(cb), Some(conn)) = (cb, self.weak_self.upgrade()) {
            self.owner.queue_in_loop(move || cb(&conn));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}
