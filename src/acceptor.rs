//! Accepts new connections on a listening socket.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::{self, Socket};

/// Receives the accepted descriptor and the peer's address.
pub(crate) type NewConnectionCallback = Arc<dyn Fn(OwnedFd, SocketAddr) + Send + Sync>;

/// Owns the listening socket and turns its readable readiness into
/// new-connection callbacks.
///
/// One connection is accepted per readiness notification (the poller is
/// level-triggered, so a backlog re-arms immediately). A reserved idle
/// descriptor keeps the loop making progress when the process runs out of
/// descriptors: see [`Acceptor::handle_read`].
pub(crate) struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    /// Creates the listening socket, binds it, and wires the read channel.
    /// Bind failures propagate: a server that cannot own its address is a
    /// setup error for the caller.
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind_address(listen_addr)?;
        let idle_fd = open_idle_fd()?;

        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            channel: Channel::new(event_loop, socket.fd()),
            socket,
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// The address the socket actually bound to (resolves ephemeral ports).
    pub(crate) fn listen_addr(&self) -> io::Result<SocketAddr> {
        socket::local_addr(self.socket.fd())
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// Starts listening and enables read interest. Loop-thread only.
    pub(crate) fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.socket.listen()?;
        self.listening.store(true, Ordering::Relaxed);
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((fd, peer_addr)) => {
                let cb = self.new_connection_cb.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(fd, peer_addr),
                    None => drop(fd),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("Acceptor::handle_read: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    // Out of descriptors and level-triggered: the pending
                    // connection would re-signal forever. Give up the
                    // reserve descriptor, accept into the freed slot, close
                    // that immediately, then re-arm the reserve.
                    let mut idle = self.idle_fd.lock().unwrap();
                    idle.take();
                    if let Ok((fd, _)) = self.socket.accept() {
                        drop(fd);
                    }
                    *idle = open_idle_fd().ok();
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Nothing to detach unless listen() registered the channel.
        if !self.listening.load(Ordering::Relaxed) {
            return;
        }
        // The owner may drop us from any thread; channel teardown belongs
        // to the loop.
        let channel = self.channel.clone();
        self.event_loop.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
        });
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
