//! A pool of loop-hosting threads handed out round-robin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

/// Starts N worker loops and hands them out to connection owners.
///
/// With zero workers every caller gets the base loop, so a single-threaded
/// server is just a pool that was never widened.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    /// Creates an empty pool bound to `base_loop`.
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Sets the worker count; must precede [`start`](EventLoopThreadPool::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::Relaxed));
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    /// Spawns the workers. Runs on the base loop's thread.
    pub fn start(&self) {
        assert!(!self.started.swap(true, Ordering::Relaxed));
        self.base_loop.assert_in_loop_thread();

        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..self.num_threads.load(Ordering::Relaxed) {
            let mut thread = EventLoopThread::new(&format!("{}{}", self.name, i));
            loops.push(thread.start_loop());
            threads.push(thread);
        }
    }

    /// Next worker loop, round-robin; the base loop when there are none.
    /// Runs on the base loop's thread.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Relaxed));
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[index].clone()
    }

    /// All worker loops, or just the base loop when there are none.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
