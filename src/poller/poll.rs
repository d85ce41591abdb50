//! The poll(2) demultiplexer.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::interest::Interest;
use crate::poller::Poller;
use crate::ready::Ready;
use crate::timestamp::Timestamp;

/// Poller backed by a compact `pollfd` array.
///
/// Each channel's poller index is its slot in the array. A channel whose
/// interest is empty keeps its slot, but the stored descriptor is
/// `-fd - 1` so the kernel ignores it while removal stays O(1); removal
/// swaps the vacated slot with the last one and patches the displaced
/// channel's index.
pub(crate) struct PollPoller {
    poll_fds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            poll_fds: Vec::new(),
            channels: HashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let result = syscall!(poll(
            self.poll_fds.as_mut_ptr(),
            self.poll_fds.len() as libc::nfds_t,
            timeout_ms,
        ));
        let now = Timestamp::now();
        match result {
            Ok(mut n) => {
                if n > 0 {
                    trace!("{} events happened", n);
                    for pfd in &self.poll_fds {
                        if n <= 0 {
                            break;
                        }
                        if pfd.revents > 0 {
                            n -= 1;
                            debug_assert!(self.channels.contains_key(&pfd.fd));
                            if let Some(channel) = self.channels.get(&pfd.fd) {
                                debug_assert_eq!(channel.fd(), pfd.fd);
                                channel.set_ready(Ready::from_poll(pfd.revents));
                                active.push(channel.clone());
                            }
                        }
                    }
                } else {
                    trace!("nothing happened");
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poll: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {} interest = {:?}", fd, channel.interest());
        if channel.index() < 0 {
            // A new one; append a slot.
            debug_assert!(!self.channels.contains_key(&fd));
            self.poll_fds.push(libc::pollfd {
                fd,
                events: interest_to_poll(channel.interest()),
                revents: 0,
            });
            channel.set_index(self.poll_fds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            debug_assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| Arc::ptr_eq(known, channel)));
            let idx = channel.index() as usize;
            debug_assert!(idx < self.poll_fds.len());
            let pfd = &mut self.poll_fds[idx];
            debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.events = interest_to_poll(channel.interest());
            pfd.revents = 0;
            pfd.fd = if channel.interest().is_none() {
                // Park the slot so the kernel skips it.
                -fd - 1
            } else {
                fd
            };
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {}", fd);
        debug_assert!(self
            .channels
            .get(&fd)
            .is_some_and(|known| Arc::ptr_eq(known, channel)));
        debug_assert!(channel.interest().is_none());
        let idx = channel.index() as usize;
        debug_assert!(idx < self.poll_fds.len());
        debug_assert_eq!(self.poll_fds[idx].fd, -fd - 1);

        self.channels.remove(&fd);
        if idx == self.poll_fds.len() - 1 {
            self.poll_fds.pop();
        } else {
            let mut displaced_fd = self.poll_fds[self.poll_fds.len() - 1].fd;
            let last = self.poll_fds.len() - 1;
            self.poll_fds.swap(idx, last);
            self.poll_fds.pop();
            if displaced_fd < 0 {
                displaced_fd = -displaced_fd - 1;
            }
            if let Some(displaced) = self.channels.get(&displaced_fd) {
                displaced.set_index(idx as i32);
            }
        }
        channel.set_index(INDEX_NEW);
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}
