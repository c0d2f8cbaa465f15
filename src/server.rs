//! The server: acceptor + loop pool + connection registry.
//!
//! The base loop owns the acceptor and the registry; accepted connections
//! are distributed across the pool and live out their lives on the chosen
//! worker loop.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::addr::InetAddress;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;
use crate::loop_pool::LoopPool;
use crate::socket::Socket;

pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base_loop: LoopHandle,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopPool>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,

    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    /// Bind a server to `listen_addr`. The socket is bound immediately;
    /// accepting starts with [`TcpServer::start`].
    pub fn new(
        base_loop: &LoopHandle,
        listen_addr: &InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> TcpServer {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop, listen_addr, reuse_port);
        let inner = Arc::new(ServerInner {
            base_loop: base_loop.clone(),
            ip_port: listen_addr.to_ip_port(),
            name: name.clone(),
            acceptor,
            pool: Mutex::new(LoopPool::new(base_loop.clone(), name)),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer| {
                if let Some(server) = weak.upgrade() {
                    ServerInner::new_connection(&server, socket, peer);
                }
            }));

        TcpServer { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// Kernel-assigned listen address; useful with an ephemeral port.
    pub fn listen_addr(&self) -> io::Result<InetAddress> {
        self.inner.acceptor.local_addr()
    }

    /// Number of worker loops; zero keeps all I/O on the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_callback.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_callback.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_callback.lock() = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_callback.lock() = Some(cb);
    }

    /// Start the pool and begin accepting. Idempotent.
    pub fn start(&self) {
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            info!(server = %self.inner.name, addr = %self.inner.ip_port, "server starting");
            let init = self.inner.thread_init_callback.lock().clone();
            self.inner.pool.lock().start(init);

            let acceptor = self.inner.acceptor.clone();
            self.inner.base_loop.run_in_loop(move || acceptor.listen());
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!(server = %self.inner.name, "server shutting down");
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        for (_name, conn) in connections {
            let local = conn.clone();
            conn.owner_loop()
                .run_in_loop(move || local.connect_destroyed());
        }
    }
}

impl ServerInner {
    /// Runs on the base loop for every accepted socket.
    fn new_connection(server: &Arc<ServerInner>, socket: Socket, peer: InetAddress) {
        server.base_loop.assert_in_loop_thread();

        let io_loop = server.pool.lock().get_next_loop();
        let id = server.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", server.name, server.ip_port, id);
        info!(server = %server.name, conn = %conn_name, peer = %peer, "new connection");

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(conn = %conn_name, error = %e, "local address query failed");
                return;
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer);
        if let Some(cb) = server.connection_callback.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = server.message_callback.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = server.write_complete_callback.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(server);
        conn.set_close_callback(Arc::new(move |closing| {
            if let Some(server) = weak.upgrade() {
                ServerInner::remove_connection(&server, closing);
            }
        }));

        server.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// May be called from any loop; hops back to the base loop where the
    /// registry lives.
    fn remove_connection(server: &Arc<ServerInner>, conn: &TcpConnectionPtr) {
        let server_ref = server.clone();
        let conn = conn.clone();
        server
            .base_loop
            .run_in_loop(move || server_ref.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.base_loop.assert_in_loop_thread();
        debug!(server = %self.name, conn = %conn.name(), "removing connection");

        if self.connections.lock().remove(conn.name()).is_some() {
            let io_loop = conn.owner_loop().clone();
            let conn = conn.clone();
            // Queued, never run inline: destruction must wait until the
            // I/O callback currently holding the channel has returned.
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}
