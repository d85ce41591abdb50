//! TCP server: acceptor, worker-loop pool, live-connection map.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info};

use crate::acceptor::Acceptor;
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::socket;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::timestamp::Timestamp;
use crate::buffer::Buffer;

/// A multi-reactor TCP server.
///
/// The acceptor runs on the base loop; each accepted connection is assigned
/// to a worker loop round-robin (or the base loop when
/// [`set_thread_num`](TcpServer::set_thread_num) was never called) and
/// stays there for its whole life. The live-connection map is owned and
/// mutated by the base loop only.
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    listen_addr: SocketAddr,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    this: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds `listen_addr` (failures propagate) and prepares the server;
    /// nothing listens until [`start`](TcpServer::start).
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let listen_addr = acceptor.listen_addr()?;

        let server = Arc::new_cyclic(|this| TcpServer {
            event_loop: event_loop.clone(),
            listen_addr,
            name: name.to_string(),
            acceptor,
            pool: Arc::new(EventLoopThreadPool::new(event_loop.clone(), name)),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            this: this.clone(),
        });

        let weak = server.this.clone();
        server
            .acceptor
            .set_new_connection_callback(Arc::new(move |sock, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(sock, peer_addr);
                }
            }));
        Ok(server)
    }

    /// The base loop.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The server's name, used as the prefix of connection names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address; useful when listening on an ephemeral port.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Number of worker loops; zero keeps every connection on the base
    /// loop. Call before [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    /// Installs the connection up/down callback for accepted connections.
    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the message callback for accepted connections.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the write-complete callback for accepted connections.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Starts the worker pool and begins listening. Idempotent; safe from
    /// any thread.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let pool = self.pool.clone();
            let acceptor = self.acceptor.clone();
            self.event_loop.run_in_loop(move || {
                pool.start();
                debug_assert!(!acceptor.listening());
                if let Err(err) = acceptor.listen() {
                    error!("TcpServer failed to listen: {}", err);
                    panic!("TcpServer failed to listen: {}", err);
                }
            });
        }
    }

    /// Live connections by name. Base-loop reads only give a stable answer.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn new_connection(&self, sock: OwnedFd, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.listen_addr, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket::local_addr(sock.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpServer::new_connection - getsockname: {}", err);
                return;
            }
        };

        let connection =
            TcpConnection::new(io_loop.clone(), conn_name.clone(), sock, local_addr, peer_addr);
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, connection.clone());

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
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn.clone());
            }
        }));

        let established = connection.clone();
        io_loop.run_in_loop(move || established.connect_established());
    }

    /// Close callbacks fire on the connection's loop; map surgery belongs
    /// to the base loop.
    fn remove_connection(&self, connection: Arc<TcpConnection>) {
        let weak = self.this.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(connection);
            }
        });
    }

    fn remove_connection_in_loop(&self, connection: Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            connection.name()
        );
        let removed = self.connections.lock().unwrap().remove(connection.name());
        debug_assert!(removed.is_some());
        let io_loop = connection.event_loop().clone();
        // The task holds the final strong reference; the destructor runs on
        // a quiescent loop iteration.
        io_loop.queue_in_loop(move || connection.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<Arc<TcpConnection>> =
            self.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for connection in connections {
            let io_loop = connection.event_loop().clone();
            io_loop.run_in_loop(move || connection.connect_destroyed());
        }
    }
}
