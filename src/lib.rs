//! Multi-reactor non-blocking TCP networking for Linux.
//!
//! `evio` is built around the classic one-loop-per-thread reactor shape:
//! each [`EventLoop`] owns a readiness demultiplexer (epoll by default,
//! poll(2) when `EVIO_USE_POLL` is set), a timer queue driven by a timerfd,
//! and an eventfd used to wake a blocked poll when work is posted from
//! another thread. [`Channel`]s bind file descriptors to callbacks;
//! [`TcpServer`] and [`TcpClient`] build buffered, callback-driven TCP
//! endpoints on top, spreading connections over a pool of worker loops.
//!
//! Everything that touches a loop's state runs on that loop's thread.
//! Cross-thread callers go through [`EventLoop::run_in_loop`] and friends,
//! which are the only operations (besides `quit`, the timer API, and
//! [`TcpConnection::send`]) documented as safe from any thread; the rest
//! assert their thread on entry.
//!
//! # Examples
//!
//! An echo server on an ephemeral port:
//!
//! ```no_run
//! use evio::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         &event_loop,
//!         "127.0.0.1:0".parse().unwrap(),
//!         "echo",
//!         false,
//!     )?;
//!     server.set_message_callback(|conn, buf, _when| {
//!         let data = buf.retrieve_all_as_bytes();
//!         conn.send(&data);
//!     });
//!     println!("listening on {}", server.listen_addr());
//!     server.start();
//!     event_loop.run();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod channel;
mod connector;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod interest;
mod poller;
mod ready;
mod socket;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod timer;
mod timestamp;

pub use crate::buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use crate::channel::{Channel, EventCallback, ReadCallback};
pub use crate::event_loop::{EventLoop, Task};
pub use crate::event_loop_thread::EventLoopThread;
pub use crate::event_loop_thread_pool::EventLoopThreadPool;
pub use crate::interest::Interest;
pub use crate::ready::Ready;
pub use crate::tcp_client::TcpClient;
pub use crate::tcp_connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use crate::tcp_server::TcpServer;
pub use crate::timer::{TimerCallback, TimerId};
pub use crate::timestamp::Timestamp;
