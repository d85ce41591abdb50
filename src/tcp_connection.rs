//! The per-connection state machine with buffered I/O.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::{self, Socket};
use crate::timestamp::Timestamp;

/// Fired on both the up and the down transition; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired when input arrives, with the input buffer and the receive time.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer drains from non-empty to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired on an upward crossing of the output high-water mark, with the
/// queued size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal: lets the owning server or client schedule removal.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnecting,
        }
    }
}

/// One established TCP connection, for both server and client use.
///
/// Connections are created by [`TcpServer`](crate::TcpServer) and
/// [`TcpClient`](crate::TcpClient), never by applications, and are handed to
/// callbacks as shared references. State moves connecting → connected →
/// disconnecting → disconnected; the close path is reachable from connected
/// or disconnecting, and `connect_established` / `connect_destroyed` each
/// run at most once.
///
/// [`send`](TcpConnection::send) is safe from any thread; everything that
/// touches the channel or the buffers runs on the owning loop.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    high_water_mark: AtomicUsize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    this: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wraps an already-connected descriptor. Called by the server's and
    /// client's connection factories only.
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        sock: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let socket = Socket::from_fd(sock);
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("TcpConnection::new [{}] - SO_KEEPALIVE: {}", name, err);
        }

        let connection = Arc::new_cyclic(|this| TcpConnection {
            channel: Channel::new(&event_loop, socket.fd()),
            event_loop,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            local_addr,
            peer_addr,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
            this: this.clone(),
            name,
        });

        let weak = connection.this.clone();
        connection.channel.set_read_callback(move |receive_time| {
            if let Some(connection) = weak.upgrade() {
                connection.handle_read(receive_time);
            }
        });
        let weak = connection.this.clone();
        connection.channel.set_write_callback(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_write();
            }
        });
        let weak = connection.this.clone();
        connection.channel.set_close_callback(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_close();
            }
        });
        let weak = connection.this.clone();
        connection.channel.set_error_callback(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_error();
            }
        });

        trace!(
            "TcpConnection::new [{}] fd = {}",
            connection.name,
            connection.socket.fd()
        );
        connection
    }

    /// The loop this connection lives on.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The connection's unique name, `{owner}-{addr}#{id}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our side of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's side of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns `true` between the up and down connection callbacks.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Disables Nagle's algorithm.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Stores an opaque application value on the connection.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Locked access to the context slot.
    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().unwrap()
    }

    /// Installs the connection up/down callback.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the message callback. Without one, input is discarded.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the output-drained callback.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the high-water callback and its threshold.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Sends `data`, copying it if the caller is not on the owning loop.
    ///
    /// Bytes from a single thread arrive in submission order; a send on a
    /// connection that is not connected is dropped with a warning.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            warn!("TcpConnection::send [{}] - not connected, dropped", self.name);
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let me = self.shared();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || me.send_in_loop(&data));
        }
    }

    /// Sends the readable contents of `buf`, draining it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != State::Connected {
            warn!("TcpConnection::send [{}] - not connected, dropped", self.name);
            return;
        }
        let data = buf.retrieve_all_as_bytes();
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let me = self.shared();
            self.event_loop.run_in_loop(move || me.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() != State::Connected {
            warn!("TcpConnection::send [{}] - not connected, give up", self.name);
            return;
        }

        let mut wrote = 0;
        let mut fault = false;
        let mut notify_write_complete = false;
        let mut notify_high_water = None;
        {
            let mut output = self.output.lock().unwrap();
            // Try a direct write when nothing is queued and the channel is
            // not already watching writability.
            if !self.channel.is_writing() && output.readable_bytes() == 0 {
                match socket::write(self.socket.fd(), data) {
                    Ok(n) => {
                        wrote = n;
                        if wrote == data.len() {
                            notify_write_complete = true;
                        }
                    }
                    Err(err) => {
                        if err.kind() != io::ErrorKind::WouldBlock {
                            error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                            if err.raw_os_error() == Some(libc::EPIPE)
                                || err.raw_os_error() == Some(libc::ECONNRESET)
                            {
                                fault = true;
                            }
                        }
                    }
                }
            }

            if !fault && wrote < data.len() {
                let remaining = data.len() - wrote;
                let old_len = output.readable_bytes();
                let mark = self.high_water_mark.load(Ordering::Relaxed);
                if old_len + remaining >= mark && old_len < mark {
                    notify_high_water = Some(old_len + remaining);
                }
                output.append(&data[wrote..]);
                if !self.channel.is_writing() {
                    self.channel.enable_writing();
                }
            }
        }

        // User notifications go through the task queue so no buffer lock is
        // held around application code.
        if notify_write_complete {
            if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                let me = self.shared();
                self.event_loop.queue_in_loop(move || cb(&me));
            }
        }
        if let Some(queued) = notify_high_water {
            if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                let me = self.shared();
                self.event_loop.queue_in_loop(move || cb(&me, queued));
            }
        }
    }

    /// Half-closes the write side once pending output has drained.
    ///
    /// Not safe against simultaneous calls; the transition itself runs on
    /// the owning loop.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let me = self.shared();
            self.event_loop.run_in_loop(move || me.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown [{}]: {}", self.name, err);
            }
        }
        // Still writing: handle_write finishes the half-close after the
        // final flush.
    }

    /// Completes establishment on the owning loop; runs exactly once.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let me = self.shared();
        let owner: Arc<dyn Any + Send + Sync> = me.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&me);
        }
    }

    /// Final teardown once the owner has dropped the connection from its
    /// map; runs exactly once, on the owning loop.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(&self.shared());
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let result = self.input.lock().unwrap().read_fd(self.socket.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.message_cb.lock().unwrap().clone();
                let mut input = self.input.lock().unwrap();
                match cb {
                    Some(cb) => cb(&self.shared(), &mut input, receive_time),
                    // No consumer installed: discard, or the buffer grows
                    // without bound.
                    None => input.retrieve_all(),
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection fd = {} is down, no more writing", self.socket.fd());
            return;
        }

        let mut drained = false;
        {
            let mut output = self.output.lock().unwrap();
            match socket::write(self.socket.fd(), output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    if output.readable_bytes() == 0 {
                        self.channel.disable_writing();
                        drained = true;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("TcpConnection::handle_write [{}]: {}", self.name, err);
                }
            }
        }

        if drained {
            if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                let me = self.shared();
                self.event_loop.queue_in_loop(move || cb(&me));
            }
            if self.state() == State::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        trace!(
            "TcpConnection::handle_close [{}] state = {:?}",
            self.name,
            self.state()
        );
        debug_assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        // The descriptor stays open until the connection drops; leaks show
        // up as held fds rather than use-after-close.
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let me = self.shared();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&me);
        }
        // Must be last: the owner will schedule connect_destroyed.
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(&me);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(self.socket.fd());
        error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {} {}",
            self.name,
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn shared(&self) -> Arc<TcpConnection> {
        self.this.upgrade().expect("connection not shared")
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.fd())
            .field("state", &self.state())
            .finish()
    }
}
