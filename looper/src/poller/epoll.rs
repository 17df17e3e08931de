//! Linux `epoll`-based poller implementation.
//!
//! Responsibilities:
//! - Own the kernel-side watch set (one `epoll` instance)
//! - Register, update and remove descriptors tagged with sequence numbers
//! - Block waiting for readiness, retrying transparently on `EINTR`
//!
//! The wake channel is registered once at construction under
//! [`WAKE_SEQ`] and stays registered for the life of the instance.

use super::common::{Event, Events, millis_until};
use super::unix::sys_epoll_create;
use crate::error::{Error, Result};

use libc::{
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Reserved tag of the wake channel.
///
/// Sequence numbers handed to regular watches start at `1` and only grow,
/// so they never reach this value.
pub(crate) const WAKE_SEQ: u64 = u64::MAX;

/// Reusable buffer `epoll_wait` writes readiness records into.
pub(crate) struct EventBuffer {
    raw: Vec<epoll_event>,
}

impl EventBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity.max(1)),
        }
    }
}

/// Linux `epoll` poller.
pub(crate) struct EpollPoller {
    epoll: OwnedFd,
}

impl EpollPoller {
    /// Creates a new epoll instance with `waker` registered as a
    /// persistent read source under [`WAKE_SEQ`].
    pub(crate) fn new(waker: RawFd) -> Result<Self> {
        let epoll = sys_epoll_create().map_err(|e| Error::setup("epoll instance", e))?;
        let poller = Self { epoll };

        poller
            .ctl(EPOLL_CTL_ADD, waker, WAKE_SEQ, Events::INPUT)
            .map_err(|e| Error::setup("wake registration", e))?;

        Ok(poller)
    }

    /// Starts watching `fd` for `interest`, tagging its records with `seq`.
    pub(crate) fn add(&self, fd: RawFd, seq: u64, interest: Events) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, seq, interest)
    }

    /// Replaces the interest and tag of an already watched `fd`.
    pub(crate) fn modify(&self, fd: RawFd, seq: u64, interest: Events) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, seq, interest)
    }

    /// Stops watching `fd`.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, seq: u64, interest: Events) -> io::Result<()> {
        let mut event = epoll_event {
            events: to_epoll(interest),
            u64: seq,
        };

        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Waits for readiness and appends one [`Event`] per ready record to
    /// `events`.
    ///
    /// `timeout_ms` follows `epoll_wait`: `-1` blocks until something is
    /// ready, `0` polls without blocking. A signal interruption restarts
    /// the wait with whatever is left of the timeout; once nothing is
    /// left the call returns with no events.
    pub(crate) fn wait(
        &self,
        buffer: &mut EventBuffer,
        events: &mut Vec<Event>,
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let mut timeout_ms = timeout_ms;

        let n = loop {
            buffer.raw.clear();

            let n = unsafe {
                epoll_wait(
                    self.epoll.as_raw_fd(),
                    buffer.raw.as_mut_ptr(),
                    buffer.raw.capacity() as i32,
                    timeout_ms,
                )
            };

            if n >= 0 {
                break n as usize;
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }

            if let Some(deadline) = deadline {
                timeout_ms = millis_until(Instant::now(), deadline);
                if timeout_ms == 0 {
                    return Ok(0);
                }
            }
        };

        unsafe {
            buffer.raw.set_len(n);
        }

        for raw in &buffer.raw {
            events.push(Event {
                seq: raw.u64,
                events: from_epoll(raw.events),
            });
        }

        Ok(n)
    }
}

fn to_epoll(interest: Events) -> u32 {
    let mut flags = 0;

    if interest.contains(Events::INPUT) {
        flags |= EPOLLIN;
    }
    if interest.contains(Events::OUTPUT) {
        flags |= EPOLLOUT;
    }

    flags as u32
}

fn from_epoll(flags: u32) -> Events {
    let mut events = Events::empty();

    if flags & EPOLLIN as u32 != 0 {
        events |= Events::INPUT;
    }
    if flags & EPOLLOUT as u32 != 0 {
        events |= Events::OUTPUT;
    }
    if flags & EPOLLERR as u32 != 0 {
        events |= Events::ERROR;
    }
    if flags & EPOLLHUP as u32 != 0 {
        events |= Events::HANGUP;
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoll_flags_map_both_ways() {
        let interest = Events::INPUT | Events::OUTPUT;
        assert_eq!(to_epoll(interest), (EPOLLIN | EPOLLOUT) as u32);

        let reported = from_epoll((EPOLLIN | EPOLLERR | EPOLLHUP) as u32);
        assert_eq!(reported, Events::INPUT | Events::ERROR | Events::HANGUP);
    }

    #[test]
    fn error_bits_are_not_requested_as_interest() {
        assert_eq!(to_epoll(Events::ERROR | Events::HANGUP), 0);
    }
}
