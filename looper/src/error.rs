//! Error types returned by the looper.

use std::io;
use std::os::fd::RawFd;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`Looper`](crate::Looper).
///
/// Interrupted waits (`EINTR`) are retried internally and never show up
/// here. Panics raised by callbacks are not errors: they unwind straight
/// out of [`poll_once`](crate::Looper::poll_once).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A kernel object the looper depends on could not be created.
    ///
    /// Returned from construction (and from a multiplexer rebuild). A
    /// looper is never handed out half-built.
    #[error("could not create {resource}: {source}")]
    Setup {
        /// Which resource failed (`"epoll instance"`, `"wake eventfd"`).
        resource: &'static str,
        #[source]
        source: io::Error,
    },

    /// A descriptor could not be added to, modified in, or removed from
    /// the watch set.
    ///
    /// The looper stays usable for every other descriptor.
    #[error("could not register fd {fd}: {source}")]
    Registration {
        /// Descriptor that was being registered.
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// `epoll_wait` failed for a reason other than a signal interruption.
    ///
    /// The looper should be considered unusable afterwards.
    #[error("waiting for events failed: {0}")]
    Wait(#[source] io::Error),
}

impl Error {
    pub(crate) fn setup(resource: &'static str, source: io::Error) -> Self {
        Self::Setup { resource, source }
    }

    pub(crate) fn registration(fd: RawFd, source: io::Error) -> Self {
        Self::Registration { fd, source }
    }

    /// Registration failure that did not come from the kernel.
    pub(crate) fn invalid_watch(fd: RawFd, reason: &'static str) -> Self {
        Self::Registration {
            fd,
            source: io::Error::new(io::ErrorKind::InvalidInput, reason),
        }
    }

    /// Returns `true` if this is a [`Registration`](Self::Registration) error.
    pub fn is_registration(&self) -> bool {
        matches!(self, Self::Registration { .. })
    }
}
