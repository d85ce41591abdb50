//! The epoll(7) demultiplexer.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::interest::Interest;
use crate::poller::Poller;
use crate::ready::Ready;
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

// Channel membership states, kept in the channel's poller index.
const NEW: i32 = INDEX_NEW;
const ADDED: i32 = 1;
const DELETED: i32 = 2;

/// Poller backed by an epoll instance.
///
/// Registration is level-triggered. The kernel carries each channel's
/// descriptor as its user data; the fd map resolves it back to the channel
/// on the way out.
pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn update(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl op = DEL fd = {}: {}", fd, err);
            } else {
                panic!("epoll_ctl op = {} fd = {}: {}", op, fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let result = syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Timestamp::now();
        match result {
            Ok(n) => {
                let n = n as usize;
                // `epoll_wait` initialised exactly `n` entries.
                unsafe { self.events.set_len(n) };
                if n > 0 {
                    trace!("{} events happened", n);
                    for event in &self.events {
                        let fd = event.u64 as RawFd;
                        debug_assert!(self.channels.contains_key(&fd));
                        if let Some(channel) = self.channels.get(&fd) {
                            channel.set_ready(Ready::from_epoll(event.events));
                            active.push(channel.clone());
                        }
                    }
                    if n == self.events.capacity() {
                        // Saturated: double so a burst is drained in fewer
                        // ticks.
                        self.events.reserve(n);
                    }
                } else {
                    trace!("nothing happened");
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        trace!("fd = {} interest = {:?} index = {}", fd, channel.interest(), index);
        if index == NEW || index == DELETED {
            if index == NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                // Parked with empty interest earlier; still in the map.
                debug_assert!(self
                    .channels
                    .get(&fd)
                    .is_some_and(|known| Arc::ptr_eq(known, channel)));
            }
            channel.set_index(ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| Arc::ptr_eq(known, channel)));
            debug_assert_eq!(index, ADDED);
            if channel.interest().is_none() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
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
        let index = channel.index();
        debug_assert!(index == ADDED || index == DELETED);
        self.channels.remove(&fd);
        if index == ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(NEW);
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT;
    }
    events as u32
}
