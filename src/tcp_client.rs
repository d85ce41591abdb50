//! TCP client: a connector plus at most one live connection.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info};

use crate::buffer::Buffer;
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::socket;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::timestamp::Timestamp;

/// A TCP client for one server address.
///
/// The connector retries failed connects with backoff;
/// [`enable_retry`](TcpClient::enable_retry) additionally reconnects after
/// an established connection goes down. All connection activity happens on
/// the client's loop.
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    this: Weak<TcpClient>,
}

impl TcpClient {
    /// Creates a client that will connect to `server_addr`.
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr, name: &str) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop, server_addr);
        let client = Arc::new_cyclic(|this| TcpClient {
            event_loop: event_loop.clone(),
            connector: connector.clone(),
            name: name.to_string(),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            this: this.clone(),
        });

        let weak = client.this.clone();
        connector.set_new_connection_callback(Arc::new(move |sock| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(sock);
            }
        }));
        client
    }

    /// The client's loop.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The client's name, used as the prefix of connection names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection, while one is established.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Reconnect after an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Relaxed);
    }

    /// Starts connecting. Safe from any thread.
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::Relaxed);
        self.connector.start();
    }

    /// Shuts down the current connection; the connector stays idle.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Relaxed);
        if let Some(connection) = self.connection.lock().unwrap().as_ref() {
            connection.shutdown();
        }
    }

    /// Stops an in-progress connect attempt.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Relaxed);
        self.connector.stop();
    }

    /// Installs the connection up/down callback.
    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the message callback.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the write-complete callback.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    fn new_connection(&self, sock: OwnedFd) {
        self.event_loop.assert_in_loop_thread();
        let peer_addr = match socket::peer_addr(sock.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection - getpeername: {}", err);
                return;
            }
        };
        let local_addr = match socket::local_addr(sock.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection - getsockname: {}", err);
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let connection = TcpConnection::new(
            self.event_loop.clone(),
            conn_name,
            sock,
            local_addr,
            peer_addr,
        );
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            connection.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            connection.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            connection.set_write_complete_callback(cb);
        }
        let weak = self.this.clone();
        connection.set_close_callback(Arc::new(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(connection.clone());
        connection.connect_established();
    }

    fn remove_connection(&self, connection: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        {
            let mut slot = self.connection.lock().unwrap();
            debug_assert!(slot
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, connection)));
            *slot = None;
        }
        let destroyed = connection.clone();
        self.event_loop
            .queue_in_loop(move || destroyed.connect_destroyed());

        if self.retry.load(Ordering::Relaxed) && self.connect.load(Ordering::Relaxed) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let connection = self.connection.lock().unwrap().take();
        match connection {
            Some(connection) => {
                // The close callback captured this client; rewire it so
                // teardown still runs once the peer goes away.
                connection.set_close_callback(Arc::new(|conn| {
                    let destroyed = conn.clone();
                    conn.event_loop()
                        .queue_in_loop(move || destroyed.connect_destroyed());
                }));
            }
            None => self.connector.stop(),
        }
    }
}
