//! Per-fd event registration and dispatch.
//!
//! A [`Channel`] records which events an fd is interested in, which events
//! the last poll reported, and what to call for each kind of event. It never
//! owns or closes the fd. Channels are loop-local: every mutation goes through
//! the owning loop's poller on the loop thread.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::event_loop::LoopCore;

const NONE_EVENT: u32 = 0;
const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;

const IN: u32 = libc::EPOLLIN as u32;
const PRI: u32 = libc::EPOLLPRI as u32;
const RDHUP: u32 = libc::EPOLLRDHUP as u32;
const HUP: u32 = libc::EPOLLHUP as u32;
const ERR: u32 = libc::EPOLLERR as u32;
const OUT: u32 = libc::EPOLLOUT as u32;

pub(crate) type EventCallback = Rc<dyn Fn()>;

pub struct Channel {
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    in_epoll: Cell<bool>,
    owner: Weak<LoopCore>,
    tie: RefCell<Option<Weak<dyn Any>>>,
    read_callback: RefCell<Option<EventCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &format_args!("{:#x}", self.events.get()))
            .field("in_epoll", &self.in_epoll.get())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(owner: Weak<LoopCore>, fd: RawFd) -> Rc<Self> {
        Rc::new(Self {
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            in_epoll: Cell::new(false),
            owner,
            tie: RefCell::new(None),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn in_epoll(&self) -> bool {
        self.in_epoll.get()
    }

    pub(crate) fn set_in_epoll(&self, in_epoll: bool) {
        self.in_epoll.set(in_epoll);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events.get() & !EDGE_TRIGGERED == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub(crate) fn set_read_callback(&self, callback: impl Fn() + 'static) {
        *self.read_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub(crate) fn set_write_callback(&self, callback: impl Fn() + 'static) {
        *self.write_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub(crate) fn set_close_callback(&self, callback: impl Fn() + 'static) {
        *self.close_callback.borrow_mut() = Some(Rc::new(callback));
    }

    pub(crate) fn set_error_callback(&self, callback: impl Fn() + 'static) {
        *self.error_callback.borrow_mut() = Some(Rc::new(callback));
    }

    /// Ties this channel to its owner so no callback runs once the owner is gone,
    /// and the owner stays alive while a callback is running.
    pub(crate) fn tie(&self, owner: &Rc<dyn Any>) {
        *self.tie.borrow_mut() = Some(Rc::downgrade(owner));
    }

    pub(crate) fn enable_reading(self: &Rc<Self>, edge_triggered: bool) {
        self.events.set(self.events.get() | READ_EVENT | if edge_triggered { EDGE_TRIGGERED } else { NONE_EVENT });
        self.update();
    }

    pub(crate) fn disable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub(crate) fn enable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_all(self: &Rc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    /// Unregisters from the owning poller. The interest set should be empty already.
    pub(crate) fn remove(&self) {
        debug_assert!(self.is_none_event(), "remove a channel that still has interest");
        if let Some(owner) = self.owner.upgrade() {
            owner.assert_in_loop_thread();
            owner.poller.borrow_mut().remove_channel(self);
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.owner.upgrade().is_some_and(|owner| owner.poller.borrow().has_channel(self))
    }

    fn update(self: &Rc<Self>) {
        match self.owner.upgrade() {
            Some(owner) => {
                owner.assert_in_loop_thread();
                owner.poller.borrow_mut().update_channel(self);
            }
            None => trace!(fd = self.fd, "skip update, the loop is gone"),
        }
    }

    /// Runs the callbacks matching the last reported `revents`.
    pub(crate) fn handle_event(&self) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(weak) => {
                // keep the owner alive until every callback returns
                if let Some(_guard) = weak.upgrade() {
                    self.dispatch();
                }
            }
            None => self.dispatch(),
        }
    }

    fn dispatch(&self) {
        let revents = self.revents.get();
        trace!(fd = self.fd, revents = format_args!("{revents:#x}"), "handle event");

        let mut closing = false;
        if revents & HUP != 0 && revents & IN == 0 {
            Self::call(&self.close_callback);
            closing = true;
        }
        if revents & ERR != 0 {
            Self::call(&self.error_callback);
            closing = true;
        }
        // the close path clears every interest, the fd is not read or written after it
        if closing && self.is_none_event() {
            return;
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            Self::call(&self.read_callback);
        }
        if revents & OUT != 0 {
            Self::call(&self.write_callback);
        }
    }

    fn call(slot: &RefCell<Option<EventCallback>>) {
        let callback = slot.borrow().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}
