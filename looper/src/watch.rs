//! Watched descriptors and what happens when they become ready.

use crate::poller::Events;

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Ident reported for watches that carry a callback.
///
/// Idents chosen by callers for callback-less watches must be `>= 0`.
pub const POLL_CALLBACK: i32 = -2;

/// What a [`FdCallback`] wants done with its watch after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep watching the descriptor.
    Keep,
    /// Stop watching the descriptor.
    Remove,
}

/// Callback invoked when a watched descriptor becomes ready.
///
/// It runs on the polling thread with no looper lock held. `data` is the
/// token supplied when the watch was added.
///
/// Any `Fn(RawFd, Events, Option<usize>) -> Action` closure that is
/// `Send + Sync` is a callback.
pub trait FdCallback: Send + Sync {
    fn on_event(&self, fd: RawFd, events: Events, data: Option<usize>) -> Action;
}

impl<F> FdCallback for F
where
    F: Fn(RawFd, Events, Option<usize>) -> Action + Send + Sync,
{
    fn on_event(&self, fd: RawFd, events: Events, data: Option<usize>) -> Action {
        self(fd, events, data)
    }
}

/// How a ready descriptor is reported.
#[derive(Clone)]
pub(crate) enum Watcher {
    /// Invoke the callback during dispatch.
    Callback(Arc<dyn FdCallback>),
    /// Hand a [`Response`] carrying `ident` back to the caller of `poll_once`.
    Ident(i32),
}

impl Watcher {
    pub(crate) fn ident(&self) -> i32 {
        match self {
            Watcher::Callback(_) => POLL_CALLBACK,
            Watcher::Ident(ident) => *ident,
        }
    }
}

/// One entry of the watch set.
#[derive(Clone)]
pub(crate) struct Request {
    pub(crate) fd: RawFd,

    /// Tag the poller reports readiness under. Re-adding the same
    /// descriptor issues a fresh one.
    pub(crate) seq: u64,

    pub(crate) interest: Events,
    pub(crate) watcher: Watcher,
    pub(crate) data: Option<usize>,
}

/// A readiness notification for a callback-less watch.
///
/// Returned through [`Poll::Ready`](crate::Poll::Ready).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Ident the watch was added with.
    pub ident: i32,
    pub fd: RawFd,
    /// Conditions the kernel reported.
    pub events: Events,
    /// Token the watch was added with.
    pub data: Option<usize>,
}

/// A ready watch queued for dispatch.
pub(crate) struct Pending {
    pub(crate) events: Events,
    pub(crate) request: Request,
}

impl Pending {
    /// Turns a callback-less notification into what `poll_once` returns.
    pub(crate) fn response(&self) -> Option<Response> {
        match self.request.watcher {
            Watcher::Callback(_) => None,
            Watcher::Ident(ident) => Some(Response {
                ident,
                fd: self.request.fd,
                events: self.events,
                data: self.request.data,
            }),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("fd", &self.fd)
            .field("seq", &self.seq)
            .field("interest", &self.interest)
            .field("ident", &self.watcher.ident())
            .field("data", &self.data)
            .finish()
    }
}
