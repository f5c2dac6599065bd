//! Ordered timers driven by a `timerfd`.
//!
//! Timers live in a map ordered by `(deadline, TimerId)`. Ids come from a
//! process wide increasing sequence, so timers sharing a deadline run in the
//! order they were created. The timerfd is armed for the earliest deadline and
//! registered on the loop as an ordinary read channel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopCore};
use crate::sys;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Never arm the timerfd for less than this, a zero value would disarm it.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

/// Identifies a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn sequence(self) -> u64 {
        self.0
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut(&EventLoop)>;

struct Timer {
    callback: TimerCallback,
    interval: Option<Duration>,
}

#[derive(Default)]
struct TimerState {
    timers: BTreeMap<(Instant, TimerId), Timer>,
    deadlines: HashMap<TimerId, Instant>,
    running_expired: bool,
    cancelled_while_running: HashSet<TimerId>,
}

pub(crate) struct TimerQueue {
    timerfd: OwnedFd,
    channel: Rc<Channel>,
    state: std::cell::RefCell<TimerState>,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue").field("timerfd", &self.timerfd).field("pending", &self.len()).finish_non_exhaustive()
    }
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<LoopCore>) -> Self {
        let timerfd = sys::timerfd().unwrap_or_else(|e| sys::fatal("timerfd_create", &e));
        let channel = Channel::new(owner, timerfd.as_raw_fd());
        Self { timerfd, channel, state: std::cell::RefCell::new(TimerState::default()) }
    }

    /// Hooks the timerfd channel into the loop. Called once the loop core exists.
    pub(crate) fn start(&self, owner: Weak<LoopCore>) {
        self.channel.set_read_callback(move || {
            if let Some(core) = owner.upgrade() {
                let event_loop = EventLoop::from_core(core);
                event_loop.core().timers().handle_expired(&event_loop);
            }
        });
        self.channel.enable_reading(false);
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub(crate) fn add(&self, id: TimerId, when: Instant, interval: Option<Duration>, callback: TimerCallback) {
        let earliest_changed = {
            let mut state = self.state.borrow_mut();
            let earliest_changed = state.timers.first_key_value().is_none_or(|((first, _), _)| when < *first);
            state.timers.insert((when, id), Timer { callback, interval });
            state.deadlines.insert(id, when);
            earliest_changed
        };
        trace!(timer = id.0, "add timer");

        if earliest_changed {
            self.arm(when);
        }
    }

    pub(crate) fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(when) = state.deadlines.remove(&id) {
            state.timers.remove(&(when, id));
            trace!(timer = id.0, "cancel timer");
        } else if state.running_expired {
            // the timer is in the batch being run right now
            state.cancelled_while_running.insert(id);
        }
    }

    fn arm(&self, when: Instant) {
        let after = when.saturating_duration_since(Instant::now()).max(MIN_ARM_DELAY);
        if let Err(e) = sys::timerfd_arm(&self.timerfd, after) {
            sys::fatal("timerfd_settime", &e);
        }
    }

    fn handle_expired(&self, event_loop: &EventLoop) {
        match sys::read_u64(&self.timerfd) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(cause = %e, "read timerfd failed"),
        }

        let now = Instant::now();
        let expired = {
            let mut state = self.state.borrow_mut();
            let rest = state.timers.split_off(&(now, TimerId(u64::MAX)));
            let expired = std::mem::replace(&mut state.timers, rest);
            for (_, id) in expired.keys() {
                state.deadlines.remove(id);
            }
            state.running_expired = true;
            state.cancelled_while_running.clear();
            expired
        };
        trace!(expired = expired.len(), "timers expired");

        let mut repeating = Vec::new();
        for ((_, id), mut timer) in expired {
            if self.state.borrow().cancelled_while_running.contains(&id) {
                continue;
            }
            (timer.callback)(event_loop);
            if let Some(interval) = timer.interval {
                repeating.push((id, timer, interval));
            }
        }

        let next = {
            let mut state = self.state.borrow_mut();
            state.running_expired = false;
            for (id, timer, interval) in repeating {
                if state.cancelled_while_running.contains(&id) {
                    continue;
                }
                let when = now + interval;
                state.timers.insert((when, id), timer);
                state.deadlines.insert(id, when);
            }
            state.cancelled_while_running.clear();
            state.timers.first_key_value().map(|((when, _), _)| *when)
        };

        if let Some(when) = next {
            self.arm(when);
        }
    }
}
