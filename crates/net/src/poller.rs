//! epoll based readiness poller.
//!
//! The poller keeps a registry from fd to the [`Channel`] that owns the
//! interest set. `epoll_event.u64` carries the fd so ready events can be
//! mapped back to their channel. Failures of `epoll_ctl` and `epoll_wait`
//! (other than `EINTR`) mean the reactor is broken and abort the process.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{trace, warn};

use crate::channel::Channel;
use crate::sys::{self, syscall};

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("epoll", &self.epoll).field("channels", &self.channels.len()).finish_non_exhaustive()
    }
}

impl Poller {
    pub(crate) fn new() -> Self {
        let epoll = sys::epoll_create().unwrap_or_else(|e| sys::fatal("epoll_create1", &e));
        Self { epoll, events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE], channels: HashMap::new() }
    }

    /// Waits up to `timeout` and pushes every ready channel, with its `revents` set, to `active`.
    pub(crate) fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<Channel>>) {
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let capacity = libc::c_int::try_from(self.events.len()).unwrap_or(libc::c_int::MAX);

        let ready = loop {
            match syscall!(epoll_wait(self.epoll.as_raw_fd(), self.events.as_mut_ptr(), capacity, timeout_ms)) {
                Ok(n) => break usize::try_from(n).unwrap_or_default(),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => sys::fatal("epoll_wait", &e),
            }
        };

        if ready == 0 {
            trace!("nothing happened");
            return;
        }
        trace!(ready, "events happened");

        for event in &self.events[..ready] {
            let fd = RawFd::try_from(event.u64).unwrap_or(-1);
            let revents = event.events;
            match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => {
                    channel.set_revents(revents);
                    active.push(channel);
                }
                None => warn!(fd, "ready event for an unknown channel"),
            }
        }

        if ready == self.events.len() {
            self.events.resize(ready * 2, libc::epoll_event { events: 0, u64: 0 });
        }
    }

    /// Registers or modifies the interest set of `channel`.
    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!(fd, events = channel.events(), "update channel");

        if channel.in_epoll() {
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_in_epoll(false);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        } else {
            self.channels.insert(fd, Rc::downgrade(channel));
            if !channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_ADD, channel);
                channel.set_in_epoll(true);
            }
        }
    }

    /// Forgets `channel`. Its interest set must already be empty or it is removed from epoll here.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        self.channels.remove(&fd);
        if channel.in_epoll() {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
            channel.set_in_epoll(false);
        }
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.get(&channel.fd()).is_some_and(|weak| std::ptr::eq(weak.as_ptr(), channel))
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event { events: channel.events(), u64: u64::try_from(fd).unwrap_or_default() };
        if let Err(e) = syscall!(epoll_ctl(self.epoll.as_raw_fd(), op, fd, &raw mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                // the fd may already be closed by its owner
                warn!(fd, cause = %e, "epoll_ctl del failed");
            } else {
                sys::fatal("epoll_ctl", &e);
            }
        }
    }
}
