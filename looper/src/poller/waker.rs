//! Cross-thread wake-up channel.
//!
//! The channel is a non-blocking `eventfd`. Writing adds to its 64-bit
//! counter and reading returns the counter and resets it to zero, so any
//! number of wakes issued before the looper gets to drain it collapse
//! into one readable event. Nothing is ever lost: a wake racing with a
//! drain either lands in the value being read or leaves the descriptor
//! readable for the next wait.

use super::unix::{sys_eventfd, sys_read, sys_write};
use crate::error::{Error, Result};

use log::{error, trace};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> Result<Self> {
        let fd = sys_eventfd().map_err(|e| Error::setup("wake eventfd", e))?;

        Ok(Self { fd })
    }

    /// Signals the channel.
    ///
    /// Safe from any thread. `EAGAIN` means the counter is saturated and a
    /// wake is already pending.
    pub(crate) fn wake(&self) {
        let buf = 1u64.to_ne_bytes();

        loop {
            let n = sys_write(self.fd.as_raw_fd(), &buf);
            if n == buf.len() as isize {
                return;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    error!("could not write to wake eventfd: {err}");
                    return;
                }
            }
        }
    }

    /// Resets the counter to zero and returns how many wakes were pending.
    pub(crate) fn drain(&self) -> u64 {
        let mut buf = [0u8; 8];

        loop {
            let n = sys_read(self.fd.as_raw_fd(), &mut buf);
            if n == buf.len() as isize {
                let count = u64::from_ne_bytes(buf);
                trace!("drained {count} pending wake(s)");
                return count;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return 0,
                _ => {
                    error!("could not read wake eventfd: {err}");
                    return 0;
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
