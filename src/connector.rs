//! Non-blocking connect with retry and backoff.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Receives the connected descriptor.
pub(crate) type NewConnectionCallback = Arc<dyn Fn(OwnedFd) + Send + Sync>;

/// Drives a non-blocking `connect(2)` to completion.
///
/// A fresh socket is watched for writability through a temporary channel;
/// on completion the descriptor is handed to the callback and the channel
/// discarded. Retryable failures reschedule the attempt through the loop's
/// timers with exponential backoff, capped at thirty seconds.
pub(crate) struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    /// The in-flight attempt: its channel plus the socket it watches.
    attempt: Mutex<Option<(Arc<Channel>, OwnedFd)>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    this: Weak<Connector>,
}

impl Connector {
    pub(crate) fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|this| Connector {
            event_loop: event_loop.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(DISCONNECTED),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY.as_millis() as u64),
            attempt: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Begins connecting. Safe from any thread.
    pub(crate) fn start(&self) {
        self.connect.store(true, Ordering::Relaxed);
        let weak = self.this.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Stops connecting and abandons any in-flight attempt. Safe from any
    /// thread.
    pub(crate) fn stop(&self) {
        self.connect.store(false, Ordering::Relaxed);
        let weak = self.this.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.stop_in_loop();
            }
        });
    }

    /// Re-enables connecting from scratch (initial backoff). Loop-thread
    /// only; used by a client reconnecting after an established connection
    /// dropped.
    pub(crate) fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.state.store(DISCONNECTED, Ordering::Relaxed);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY.as_millis() as u64, Ordering::Relaxed);
        self.connect.store(true, Ordering::Relaxed);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state.load(Ordering::Relaxed), DISCONNECTED);
        if self.connect.load(Ordering::Relaxed) {
            self.do_connect();
        } else {
            debug!("Connector::start_in_loop - do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state.load(Ordering::Relaxed) == CONNECTING {
            self.state.store(DISCONNECTED, Ordering::Relaxed);
            if let Some(sock) = self.detach_attempt() {
                self.retry(sock);
            }
        }
    }

    fn do_connect(&self) {
        let sock = match socket::new_nonblocking(self.server_addr) {
            Ok(sock) => sock,
            Err(err) => {
                error!("Connector::do_connect - socket: {}", err);
                return;
            }
        };
        let errno = match socket::connect(sock.as_raw_fd(), self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(libc::EINVAL),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(sock),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(sock),

            libc::EACCES | libc::EPERM | libc::EAFNOSUPPORT | libc::EALREADY | libc::EBADF
            | libc::EFAULT | libc::ENOTSOCK => {
                error!("Connector::do_connect - connect error {}", errno);
            }

            _ => {
                error!("Connector::do_connect - unexpected error {}", errno);
            }
        }
    }

    /// Watches the pending socket for writability.
    fn connecting(&self, sock: OwnedFd) {
        self.state.store(CONNECTING, Ordering::Relaxed);
        let channel = Channel::new(&self.event_loop, sock.as_raw_fd());

        let weak = self.this.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.this.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });

        channel.enable_writing();
        *self.attempt.lock().unwrap() = Some((channel, sock));
    }

    /// Detaches the attempt's channel and recovers the socket. The channel
    /// object itself stays alive until the dispatch loop releases its
    /// reference, so dropping ours mid-callback is fine.
    fn detach_attempt(&self) -> Option<OwnedFd> {
        let (channel, sock) = self.attempt.lock().unwrap().take()?;
        channel.disable_all();
        channel.remove();
        Some(sock)
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write");
        if self.state.load(Ordering::Relaxed) == CONNECTING {
            let Some(sock) = self.detach_attempt() else {
                return;
            };
            // Writable does not mean connected: check the socket error.
            let err = socket::socket_error(sock.as_raw_fd());
            if err != 0 {
                warn!(
                    "Connector::handle_write - SO_ERROR = {} {}",
                    err,
                    std::io::Error::from_raw_os_error(err)
                );
                self.retry(sock);
            } else if socket::is_self_connect(sock.as_raw_fd()) {
                warn!("Connector::handle_write - self connect");
                self.retry(sock);
            } else {
                self.state.store(CONNECTED, Ordering::Relaxed);
                if self.connect.load(Ordering::Relaxed) {
                    let cb = self.new_connection_cb.lock().unwrap().clone();
                    match cb {
                        Some(cb) => cb(sock),
                        None => drop(sock),
                    }
                }
            }
        } else {
            debug_assert_eq!(self.state.load(Ordering::Relaxed), DISCONNECTED);
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error");
        if self.state.load(Ordering::Relaxed) == CONNECTING {
            if let Some(sock) = self.detach_attempt() {
                let err = socket::socket_error(sock.as_raw_fd());
                trace!("SO_ERROR = {}", err);
                self.retry(sock);
            }
        }
    }

    /// Closes the failed socket and schedules another attempt with doubled
    /// backoff.
    fn retry(&self, sock: OwnedFd) {
        drop(sock);
        self.state.store(DISCONNECTED, Ordering::Relaxed);
        if self.connect.load(Ordering::Relaxed) {
            let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::Relaxed));
            info!(
                "Connector::retry - retry connecting to {} in {:?}",
                self.server_addr, delay
            );
            let weak = self.this.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });
            let next = (delay * 2).min(MAX_RETRY_DELAY);
            self.retry_delay_ms
                .store(next.as_millis() as u64, Ordering::Relaxed);
        } else {
            debug!("Connector::retry - do not connect");
        }
    }
}
