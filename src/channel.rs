//! The per-descriptor object that mediates between an event loop and its
//! poller.

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::event_loop::EventLoop;
use crate::interest::Interest;
use crate::ready::Ready;
use crate::timestamp::Timestamp;

/// Callback invoked on readable readiness, with the poll-return time.
pub type ReadCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;

/// Callback invoked on writable, close, or error readiness.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Poller bookkeeping value for a channel the poller has never seen.
pub(crate) const INDEX_NEW: i32 = -1;

/// Binds one file descriptor to its interest mask and per-event callbacks.
///
/// A channel never owns its descriptor and never performs I/O; it remembers
/// what its owner wants to hear about and dispatches the poller's answers.
/// Exactly one channel may exist per descriptor, it belongs to exactly one
/// [`EventLoop`], and all interest changes and event dispatch happen on that
/// loop's thread.
///
/// An owner whose lifetime must span event handling (a connection that may
/// be torn down from inside its own callback) registers itself with
/// [`Channel::tie`]; the weak tie is upgraded to a strong reference for the
/// duration of the dispatch.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU8,
    ready: AtomicU8,
    index: AtomicI32,
    handling: AtomicBool,
    tied: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    log_hup: AtomicBool,
    read_cb: Mutex<Option<ReadCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
    this: Weak<Channel>,
}

impl Channel {
    /// Creates a channel for `fd` owned by `event_loop`.
    ///
    /// The descriptor is not registered with the poller until interest is
    /// first enabled.
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Channel::with_loop(Arc::downgrade(event_loop), fd)
    }

    pub(crate) fn with_loop(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|this| Channel {
            event_loop,
            fd,
            interest: AtomicU8::new(Interest::NONE.bits()),
            ready: AtomicU8::new(Ready::EMPTY.bits()),
            index: AtomicI32::new(INDEX_NEW),
            handling: AtomicBool::new(false),
            tied: AtomicBool::new(false),
            tie: Mutex::new(None),
            log_hup: AtomicBool::new(true),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// The descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The interest mask currently declared to the poller.
    pub fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Relaxed))
    }

    pub(crate) fn set_ready(&self, ready: Ready) {
        self.ready.store(ready.bits(), Ordering::Relaxed);
    }

    pub(crate) fn ready(&self) -> Ready {
        Ready::from_bits(self.ready.load(Ordering::Relaxed))
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Installs the readable-readiness callback.
    pub fn set_read_callback(&self, cb: impl Fn(Timestamp) + Send + Sync + 'static) {
        *self.read_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the writable-readiness callback.
    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.write_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the peer-hangup callback.
    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.close_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.error_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Ties this channel to the object whose lifetime must cover event
    /// handling.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
        self.tied.store(true, Ordering::Relaxed);
    }

    /// Suppresses the warning normally logged on peer hangup.
    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.store(on, Ordering::Relaxed);
    }

    /// Starts watching for readable readiness.
    pub fn enable_reading(&self) {
        self.set_interest(self.interest().add(Interest::READABLE));
    }

    /// Stops watching for readable readiness.
    pub fn disable_reading(&self) {
        self.set_interest(self.interest().remove(Interest::READABLE));
    }

    /// Starts watching for writable readiness.
    pub fn enable_writing(&self) {
        self.set_interest(self.interest().add(Interest::WRITABLE));
    }

    /// Stops watching for writable readiness.
    pub fn disable_writing(&self) {
        self.set_interest(self.interest().remove(Interest::WRITABLE));
    }

    /// Stops watching for everything.
    pub fn disable_all(&self) {
        self.set_interest(Interest::NONE);
    }

    /// Returns `true` while writable interest is declared.
    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    /// Returns `true` while readable interest is declared.
    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    fn set_interest(&self, interest: Interest) {
        self.interest.store(interest.bits(), Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        if let (Some(event_loop), Some(me)) = (self.event_loop.upgrade(), self.this.upgrade()) {
            event_loop.update_channel(&me);
        }
    }

    /// Detaches the channel from its poller. Interest must already be empty.
    pub fn remove(&self) {
        assert!(self.interest().is_none());
        if let (Some(event_loop), Some(me)) = (self.event_loop.upgrade(), self.this.upgrade()) {
            event_loop.remove_channel(&me);
        }
    }

    /// Dispatches the readiness recorded by the poller.
    ///
    /// Runs on the owning loop only. If a tie is installed, it must be
    /// upgradable for the duration of the dispatch; otherwise the event is
    /// dropped on the floor, which is the correct outcome for an owner that
    /// is already gone.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        if self.tied.load(Ordering::Relaxed) {
            let tie = self.tie.lock().unwrap().clone();
            if let Some(guard) = tie.and_then(|weak| weak.upgrade()) {
                self.handle_event_with_guard(receive_time);
                drop(guard);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.handling.store(true, Ordering::Relaxed);
        let ready = self.ready();

        if ready.is_hup() && !ready.is_readable() {
            if self.log_hup.load(Ordering::Relaxed) {
                warn!("channel fd = {} hung up", self.fd);
            }
            if let Some(cb) = self.close_cb.lock().unwrap().clone() {
                cb();
            }
        }

        if ready.is_invalid() {
            warn!("channel fd = {} is not an open descriptor", self.fd);
        }

        if ready.is_error() || ready.is_invalid() {
            if let Some(cb) = self.error_cb.lock().unwrap().clone() {
                cb();
            }
        }

        if ready.is_readable() || ready.is_pri() || ready.is_read_closed() {
            if let Some(cb) = self.read_cb.lock().unwrap().clone() {
                cb(receive_time);
            }
        }

        if ready.is_writable() {
            if let Some(cb) = self.write_cb.lock().unwrap().clone() {
                cb();
            }
        }

        self.handling.store(false, Ordering::Relaxed);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.handling.load(Ordering::Relaxed));
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("ready", &self.ready())
            .finish()
    }
}
