//! Turns listen-socket readiness into new-connection events on the base
//! loop.

use std::fs::File;
use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::addr::InetAddress;
use crate::callbacks::NewConnectionCallback;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::Socket;

pub struct Acceptor {
    owner: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    /// Reserved placeholder fd, sacrificed to drain a pending connection
    /// when the process runs out of descriptors. Without it a level-
    /// triggered poller would spin on the connection it cannot accept.
    idle_fd: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    /// Open, configure, and bind the listen socket.
    ///
    /// `SO_REUSEADDR` is always set; `SO_REUSEPORT` per `reuse_port`.
    /// Binding happens here, so the kernel-assigned port is queryable
    /// before `listen`.
    ///
    /// # Panics
    /// Socket creation and bind failures are fatal.
    pub fn new(owner: &LoopHandle, listen_addr: &InetAddress, reuse_port: bool) -> Arc<Acceptor> {
        let socket = Socket::new_nonblocking();
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr);

        let channel = Channel::new(owner.clone(), socket.fd());
        let acceptor = Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |_ts| {
                if let Some(acceptor) = w.upgrade() {
                    acceptor.handle_read();
                }
            }));
            Acceptor {
                owner: owner.clone(),
                socket,
                channel: channel.clone(),
                listening: AtomicBool::new(false),
                new_connection_callback: Mutex::new(None),
                idle_fd: Mutex::new(open_idle_fd()),
            }
        });
        debug!(addr = %listen_addr, fd = acceptor.socket.fd(), "acceptor bound");
        acceptor
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.lock() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Kernel-assigned listen address.
    pub(crate) fn local_addr(&self) -> io::Result<InetAddress> {
        self.socket.local_addr()
    }

    /// Start listening and arm read interest. Must run on the base loop.
    pub fn listen(&self) {
        self.owner.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        self.socket.listen();
        self.channel.enable_reading();
    }

    /// Accept everything the backlog holds, until the socket would block.
    fn handle_read(&self) {
        debug_assert!(self.owner.is_in_loop_thread());
        loop {
            match self.socket.accept() {
                Ok((sock, peer)) => {
                    let mut cb = self.new_connection_callback.lock();
                    match cb.as_mut() {
                        Some(cb) => cb(sock, peer),
                        None => {
                            debug!(peer = %peer, "no new-connection callback, dropping socket")
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_fd_exhaustion(&e) => {
                    error!(error = %e, "accept failed: file descriptors exhausted");
                    self.shed_pending_connection();
                    break;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Free the placeholder fd, accept-and-close the connection we had no
    /// descriptor for, then re-reserve the placeholder.
    fn shed_pending_connection(&self) {
        let mut idle = self.idle_fd.lock();
        match idle.take() {
            Some(placeholder) => {
                drop(placeholder);
                if let Err(e) = self.socket.accept() {
                    debug!(error = %e, "shed accept failed");
                }
                *idle = open_idle_fd();
            }
            None => warn!("no placeholder fd reserved; pending connection left in backlog"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn open_idle_fd() -> Option<OwnedFd> {
    match File::open("/dev/null") {
        Ok(file) => Some(OwnedFd::from(file)),
        Err(e) => {
            warn!(error = %e, "could not reserve placeholder fd");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn accepts_a_connection_and_reports_the_peer() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();

        let acceptor = Acceptor::new(&handle, &InetAddress::localhost(0), false);
        let addr = acceptor.local_addr().unwrap();

        let (tx, rx) = mpsc::channel();
        let quit_handle = handle.clone();
        acceptor.set_new_connection_callback(Box::new(move |sock, peer| {
            tx.send((sock.fd(), peer)).unwrap();
            quit_handle.quit();
        }));
        acceptor.listen();
        assert!(acceptor.listening());

        let client = thread::spawn(move || {
            TcpStream::connect(("127.0.0.1", addr.port())).unwrap()
        });

        event_loop.run();
        let (fd, peer) = rx.try_recv().unwrap();
        assert!(fd >= 0);

        let stream = client.join().unwrap();
        assert_eq!(peer.port(), stream.local_addr().unwrap().port());
    }
}
