//! A thread whose sole job is to run one event loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::error;

use crate::event_loop::EventLoop;

/// Hosts one [`EventLoop`] on a dedicated thread.
///
/// [`start_loop`](EventLoopThread::start_loop) blocks until the loop exists
/// and hands back a shared reference; dropping the host quits the loop and
/// joins the thread.
pub struct EventLoopThread {
    name: String,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates an idle host; nothing runs until `start_loop`.
    pub fn new(name: &str) -> EventLoopThread {
        EventLoopThread {
            name: name.to_string(),
            event_loop: None,
            thread: None,
        }
    }

    /// Spawns the thread, waits for its loop to be constructed, and returns
    /// the loop.
    ///
    /// Panics if the loop cannot be built: a reactor the process asked for
    /// and cannot have is a setup failure, not a quiet dead worker.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.thread.is_none());

        type Slot = Mutex<Option<std::io::Result<Arc<EventLoop>>>>;
        let shared = Arc::new((Slot::new(None), Condvar::new()));
        let published = shared.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let (slot, ready) = &*published;
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        error!("failed to create event loop: {}", err);
                        *slot.lock().unwrap() = Some(Err(err));
                        ready.notify_one();
                        return;
                    }
                };
                *slot.lock().unwrap() = Some(Ok(event_loop.clone()));
                ready.notify_one();
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let (slot, ready) = &*shared;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }
        let event_loop = match guard.take() {
            Some(Ok(event_loop)) => event_loop,
            Some(Err(err)) => panic!("failed to create event loop: {}", err),
            None => unreachable!(),
        };
        drop(guard);

        self.event_loop = Some(event_loop.clone());
        self.thread = Some(thread);
        event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            // `run` clears the quit flag on entry, so a plain quit() here
            // could be lost if the thread has not reached run() yet. A
            // posted task survives that window: the first tick drains it.
            let stopper = event_loop.clone();
            event_loop.queue_in_loop(move || stopper.quit());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
