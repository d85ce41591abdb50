//! The per-thread reactor.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::{new_default_poller, Poller};
use crate::timer::{TimerCallback, TimerId, TimerQueue};
use crate::timestamp::Timestamp;

const POLL_TIMEOUT_MS: i32 = 10_000;

/// A deferred unit of work executed by the owning loop.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// A reactor: at most one per thread.
///
/// The loop owns a readiness poller, a timer queue, an eventfd used to wake
/// a blocked poll, and a queue of posted tasks. One call to [`run`] on the
/// constructing thread dispatches readiness callbacks and drained tasks
/// until [`quit`] is observed.
///
/// Methods split into two groups. Safe from any thread: [`run_in_loop`],
/// [`queue_in_loop`], [`run_at`], [`run_after`], [`run_every`], [`cancel`],
/// and [`quit`]. Everything else must be called on the owning thread and
/// panics otherwise.
///
/// [`run`]: EventLoop::run
/// [`quit`]: EventLoop::quit
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`run_at`]: EventLoop::run_at
/// [`run_after`]: EventLoop::run_after
/// [`run_every`]: EventLoop::run_every
/// [`cancel`]: EventLoop::cancel
pub struct EventLoop {
    this: Weak<EventLoop>,
    thread: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    poll_return_time: AtomicI64,
    poller: Mutex<Box<dyn Poller>>,
    timers: TimerQueue,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
    /// Descriptors of this tick's active channels, for the removal guard.
    active_fds: Mutex<Vec<RawFd>>,
    current_active: AtomicI32,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates the loop for the current thread.
    ///
    /// Panics if this thread already runs one; fails if the poller, timer
    /// fd, or wakeup fd cannot be created.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        CURRENT.with(|current| {
            if current.borrow().upgrade().is_some() {
                error!("another EventLoop already exists in {:?}", thread::current().id());
                panic!("one event loop per thread");
            }
        });

        let poller = new_default_poller()?;
        let timer_fd = TimerQueue::create_timer_fd()?;
        let wakeup_fd = create_event_fd()?;

        let event_loop = Arc::new_cyclic(|this: &Weak<EventLoop>| EventLoop {
            this: this.clone(),
            thread: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poll_return_time: AtomicI64::new(0),
            poller: Mutex::new(poller),
            wakeup_channel: Channel::with_loop(this.clone(), wakeup_fd.as_raw_fd()),
            timers: TimerQueue::with_fd(this.clone(), timer_fd),
            wakeup_fd,
            active_fds: Mutex::new(Vec::new()),
            current_active: AtomicI32::new(-1),
            pending: Mutex::new(Vec::new()),
        });

        // The internal channels can only register once the Arc exists: their
        // updates reach the poller through an upgraded loop reference.
        let weak = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup();
            }
        });
        event_loop.wakeup_channel.enable_reading();

        let weak = Arc::downgrade(&event_loop);
        event_loop.timers.channel().set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timers.handle_read(&event_loop);
            }
        });
        event_loop.timers.channel().enable_reading();

        CURRENT.with(|current| *current.borrow_mut() = Arc::downgrade(&event_loop));
        trace!("EventLoop created in {:?}", event_loop.thread);
        Ok(event_loop)
    }

    /// The loop constructed on the current thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        CURRENT.with(|current| current.borrow().upgrade())
    }

    /// Returns `true` when called on the loop's owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Panics unless called on the loop's owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                "EventLoop owned by {:?} used from {:?}",
                self.thread,
                thread::current().id()
            );
            panic!("event loop used off its thread");
        }
    }

    /// Runs the dispatch loop until [`quit`](EventLoop::quit).
    ///
    /// Each tick: poll (bounded at ten seconds), dispatch every active
    /// channel with the poll-return timestamp, then drain the task queue.
    pub fn run(&self) {
        assert!(!self.looping.load(Ordering::Relaxed));
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Relaxed);
        self.quit.store(false, Ordering::Release);
        trace!("EventLoop start looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let now = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return_time.store(now.as_micros(), Ordering::Relaxed);

            {
                let mut fds = self.active_fds.lock().unwrap();
                fds.clear();
                fds.extend(active.iter().map(|channel| channel.fd()));
            }

            self.event_handling.store(true, Ordering::Relaxed);
            for channel in &active {
                self.current_active.store(channel.fd(), Ordering::Relaxed);
                channel.handle_event(now);
            }
            self.current_active.store(-1, Ordering::Relaxed);
            self.event_handling.store(false, Ordering::Relaxed);

            self.do_pending_tasks();
        }

        trace!("EventLoop stop looping");
        self.looping.store(false, Ordering::Relaxed);
    }

    /// Asks the loop to exit after the current tick. Safe from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Runs `task` now when called on the loop thread, otherwise posts it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Posts `task` for execution at the end of a tick. Safe from any
    /// thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        // Wake when posting from outside, or when the loop is already past
        // this tick's drain and would otherwise block before seeing it.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Runs `callback` at the absolute time `when`. Safe from any thread.
    pub fn run_at(&self, when: Timestamp, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timers
            .add_timer(&self.shared(), Arc::new(callback), when, Duration::ZERO)
    }

    /// Runs `callback` once after `delay`. Safe from any thread.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Runs `callback` every `interval`, first firing one interval from
    /// now. Safe from any thread.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        let callback: TimerCallback = Arc::new(callback);
        self.timers
            .add_timer(&self.shared(), callback, Timestamp::now() + interval, interval)
    }

    /// Cancels a scheduled timer. Safe from any thread.
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(&self.shared(), id);
    }

    /// Timestamp taken right after the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_time.load(Ordering::Relaxed))
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if self.event_handling.load(Ordering::Relaxed) {
            // Removing any other channel that is still queued in this tick
            // would dispatch into a detached channel later in the iteration.
            debug_assert!(
                self.current_active.load(Ordering::Relaxed) == channel.fd()
                    || !self.active_fds.lock().unwrap().contains(&channel.fd())
            );
        }
        self.poller.lock().unwrap().remove_channel(channel);
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = syscall!(write(
            self.wakeup_fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            mem::size_of::<u64>(),
        ));
        match n {
            Ok(n) if n as usize == mem::size_of::<u64>() => {}
            Ok(n) => error!("EventLoop::wakeup writes {} bytes instead of 8", n),
            Err(err) => error!("EventLoop::wakeup: {}", err),
        }
    }

    fn handle_wakeup(&self) {
        let mut one: u64 = 0;
        let n = syscall!(read(
            self.wakeup_fd.as_raw_fd(),
            &mut one as *mut u64 as *mut libc::c_void,
            mem::size_of::<u64>(),
        ));
        match n {
            Ok(n) if n as usize == mem::size_of::<u64>() => {}
            Ok(n) => error!("EventLoop::handle_wakeup reads {} bytes instead of 8", n),
            Err(err) => error!("EventLoop::handle_wakeup: {}", err),
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // Swap the queue out so user tasks run without the lock: posting
        // from inside a task cannot deadlock, and enqueuers are never held
        // up by callback work.
        let tasks: Vec<Task> = mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn shared(&self) -> Arc<EventLoop> {
        self.this.upgrade().expect("event loop owner already dropped")
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug_assert!(!self.looping.load(Ordering::Relaxed));
    }
}

fn create_event_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.thread)
            .field("looping", &self.looping.load(Ordering::Relaxed))
            .finish()
    }
}
