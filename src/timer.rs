//! Timers driven by a timer file descriptor.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::cmp::Ordering as CmpOrdering;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Callback run when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

/// One scheduled callback, one-shot or periodic.
pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: AtomicI64,
    interval: Duration,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    fn new(callback: TimerCallback, when: Timestamp, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration: AtomicI64::new(when.as_micros()),
            repeat: interval > Duration::ZERO,
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    fn run(&self) {
        (self.callback)();
    }

    fn expiration(&self) -> Timestamp {
        Timestamp::from_micros(self.expiration.load(Ordering::Relaxed))
    }

    fn restart(&self, now: Timestamp) {
        let next = if self.repeat {
            now + self.interval
        } else {
            Timestamp::zero()
        };
        self.expiration.store(next.as_micros(), Ordering::Relaxed);
    }
}

/// Identity of a timer across storage reuse: (address, sequence).
///
/// The sequence alone is already unique, but the address keeps lookups
/// honest if an id ever outlives its timer.
type TimerKey = (usize, u64);

fn key_of(timer: &Arc<Timer>) -> TimerKey {
    (Arc::as_ptr(timer) as usize, timer.sequence)
}

/// Opaque handle for cancelling a timer registered with an event loop.
#[derive(Clone)]
pub struct TimerId {
    timer: Weak<Timer>,
    sequence: u64,
}

impl TimerId {
    fn key(&self) -> TimerKey {
        (Weak::as_ptr(&self.timer) as usize, self.sequence)
    }
}

impl std::fmt::Debug for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerId")
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Primary index entry, totally ordered by (expiration, identity).
struct Entry(Timestamp, Arc<Timer>);

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.0 == other.0 && key_of(&self.1) == key_of(&other.1)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        (self.0, key_of(&self.1)).cmp(&(other.0, key_of(&other.1)))
    }
}

#[derive(Default)]
struct TimerList {
    /// Ordered by (expiration, identity) for expiry scans.
    by_expiration: BTreeSet<Entry>,
    /// Ordered by identity for cancellation.
    active: BTreeMap<TimerKey, Arc<Timer>>,
    /// Timers cancelled while their callbacks were executing this tick.
    cancelling: HashSet<TimerKey>,
}

/// Ordered timer collection driven by a single timerfd.
///
/// All mutation happens on the owning loop; cross-thread `add_timer` and
/// `cancel` post through it. The timerfd is registered as a plain read
/// channel and stays armed for the earliest expiration.
pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    channel: Arc<Channel>,
    timers: Mutex<TimerList>,
    calling_expired: AtomicBool,
}

impl TimerQueue {
    pub(crate) fn create_timer_fd() -> io::Result<OwnedFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub(crate) fn with_fd(event_loop: Weak<EventLoop>, timer_fd: OwnedFd) -> TimerQueue {
        let channel = Channel::with_loop(event_loop, timer_fd.as_raw_fd());
        TimerQueue {
            timer_fd,
            channel,
            timers: Mutex::new(TimerList::default()),
            calling_expired: AtomicBool::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Schedules `callback` at `when`, repeating every `interval` unless it
    /// is zero. Safe from any thread.
    pub(crate) fn add_timer(
        &self,
        event_loop: &Arc<EventLoop>,
        callback: TimerCallback,
        when: Timestamp,
        interval: Duration,
    ) -> TimerId {
        let timer = Arc::new(Timer::new(callback, when, interval));
        let id = TimerId {
            timer: Arc::downgrade(&timer),
            sequence: timer.sequence,
        };
        let captured = event_loop.clone();
        event_loop.run_in_loop(move || captured.timers().add_timer_in_loop(&captured, timer));
        id
    }

    /// Cancels `id` if it has not fired; a timer cancelled from inside its
    /// own callback finishes the in-flight call but never rearms. Safe from
    /// any thread.
    pub(crate) fn cancel(&self, event_loop: &Arc<EventLoop>, id: TimerId) {
        let captured = event_loop.clone();
        event_loop.run_in_loop(move || captured.timers().cancel_in_loop(&captured, id));
    }

    fn add_timer_in_loop(&self, event_loop: &Arc<EventLoop>, timer: Arc<Timer>) {
        event_loop.assert_in_loop_thread();
        let when = timer.expiration();
        let earliest_changed = {
            let mut list = self.timers.lock().unwrap();
            insert_locked(&mut list, timer)
        };
        if earliest_changed {
            self.reset_timer_fd(when);
        }
    }

    fn cancel_in_loop(&self, event_loop: &Arc<EventLoop>, id: TimerId) {
        event_loop.assert_in_loop_thread();
        let mut list = self.timers.lock().unwrap();
        debug_assert_eq!(list.by_expiration.len(), list.active.len());
        let key = id.key();
        if let Some(timer) = list.active.remove(&key) {
            let removed = list.by_expiration.remove(&Entry(timer.expiration(), timer));
            debug_assert!(removed);
        } else if self.calling_expired.load(Ordering::Relaxed) {
            list.cancelling.insert(key);
        }
        debug_assert_eq!(list.by_expiration.len(), list.active.len());
    }

    /// Timerfd readable: drain the expiry count, run everything due, rearm.
    pub(crate) fn handle_read(&self, event_loop: &Arc<EventLoop>) {
        event_loop.assert_in_loop_thread();
        let now = Timestamp::now();
        read_timer_fd(self.timer_fd.as_raw_fd(), now);

        let expired = self.get_expired(now);

        self.calling_expired.store(true, Ordering::Relaxed);
        self.timers.lock().unwrap().cancelling.clear();
        for timer in &expired {
            timer.run();
        }
        self.calling_expired.store(false, Ordering::Relaxed);

        self.reset(expired, now);
    }

    /// Moves every timer with expiration <= `now` out of both indexes,
    /// earliest first.
    fn get_expired(&self, now: Timestamp) -> Vec<Arc<Timer>> {
        let mut list = self.timers.lock().unwrap();
        debug_assert_eq!(list.by_expiration.len(), list.active.len());
        let expired: Vec<Arc<Timer>> = list
            .by_expiration
            .iter()
            .take_while(|entry| entry.0 <= now)
            .map(|entry| entry.1.clone())
            .collect();
        for timer in &expired {
            let removed = list
                .by_expiration
                .remove(&Entry(timer.expiration(), timer.clone()));
            debug_assert!(removed);
            let removed = list.active.remove(&key_of(timer));
            debug_assert!(removed.is_some());
        }
        debug_assert_eq!(list.by_expiration.len(), list.active.len());
        expired
    }

    /// Re-inserts repeating, non-cancelled timers and rearms the fd for the
    /// new earliest expiration.
    fn reset(&self, expired: Vec<Arc<Timer>>, now: Timestamp) {
        let next_expire = {
            let mut list = self.timers.lock().unwrap();
            for timer in expired {
                if timer.repeat && !list.cancelling.contains(&key_of(&timer)) {
                    timer.restart(now);
                    insert_locked(&mut list, timer);
                }
                // One-shot or cancelled: the last strong reference drops here.
            }
            list.by_expiration
                .iter()
                .next()
                .map(|entry| entry.1.expiration())
        };
        if let Some(when) = next_expire {
            if when.is_valid() {
                self.reset_timer_fd(when);
            }
        }
    }

    fn reset_timer_fd(&self, expiration: Timestamp) {
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: time_from_now(expiration),
        };
        let mut old_value: libc::itimerspec = unsafe { std::mem::zeroed() };
        if let Err(err) = syscall!(timerfd_settime(
            self.timer_fd.as_raw_fd(),
            0,
            &new_value,
            &mut old_value,
        )) {
            error!("timerfd_settime: {}", err);
        }
    }
}

fn insert_locked(list: &mut TimerList, timer: Arc<Timer>) -> bool {
    debug_assert_eq!(list.by_expiration.len(), list.active.len());
    let when = timer.expiration();
    let earliest_changed = match list.by_expiration.iter().next() {
        None => true,
        Some(first) => when < first.0,
    };
    let inserted = list.by_expiration.insert(Entry(when, timer.clone()));
    debug_assert!(inserted);
    let previous = list.active.insert(key_of(&timer), timer);
    debug_assert!(previous.is_none());
    debug_assert_eq!(list.by_expiration.len(), list.active.len());
    earliest_changed
}

/// Interval until `when`, floored at 100 µs: arming a timerfd with zero
/// would disarm it.
fn time_from_now(when: Timestamp) -> libc::timespec {
    let mut micros = when.as_micros() - Timestamp::now().as_micros();
    if micros < 100 {
        micros = 100;
    }
    libc::timespec {
        tv_sec: (micros / 1_000_000) as libc::time_t,
        tv_nsec: ((micros % 1_000_000) * 1_000) as libc::c_long,
    }
}

/// Reads the expiry count so the level-triggered fd stops signalling.
fn read_timer_fd(fd: RawFd, now: Timestamp) {
    let mut count: u64 = 0;
    let n = syscall!(read(
        fd,
        &mut count as *mut u64 as *mut libc::c_void,
        std::mem::size_of::<u64>(),
    ));
    trace!("timer fd fired {:?} times at {}", count, now);
    match n {
        Ok(n) if n as usize == std::mem::size_of::<u64>() => {}
        Ok(n) => error!("read_timer_fd reads {} bytes instead of 8", n),
        Err(err) => error!("read_timer_fd: {}", err),
    }
}
