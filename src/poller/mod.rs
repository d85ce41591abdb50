//! Readiness demultiplexers.
//!
//! Two variants share one contract: `poll` blocks up to the timeout and
//! appends the channels with readiness (their [`Ready`](crate::Ready) set
//! already recorded), returning the timestamp observed right after the
//! kernel call; `update_channel` reconciles a channel's declared interest
//! with the kernel's view; `remove_channel` detaches it. All three run on
//! the owning loop's thread only, which [`EventLoop`](crate::EventLoop)
//! enforces before forwarding.

use std::env;
use std::io;
use std::sync::Arc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollPoller;
pub(crate) use self::poll::PollPoller;

/// Environment variable that forces the poll(2) variant.
const USE_POLL_ENV: &str = "EVIO_USE_POLL";

pub(crate) trait Poller: Send {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp;

    fn update_channel(&mut self, channel: &Arc<Channel>);

    fn remove_channel(&mut self, channel: &Arc<Channel>);
}

/// Picks the poller variant for a new loop: epoll unless `EVIO_USE_POLL`
/// is set.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        EpollPoller::new().map(|poller| Box::new(poller) as Box<dyn Poller>)
    }
}
