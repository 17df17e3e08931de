//! Platform I/O readiness multiplexing.
//!
//! This module wraps the kernel facilities the looper sleeps on:
//! - an `epoll` instance holding the watch set,
//! - an `eventfd` used to interrupt a blocked wait from any thread.
//!
//! Only Linux is supported; the looper relies on `eventfd` semantics
//! (coalescing counter, read-to-drain) for its wake-ups.

#[cfg(not(target_os = "linux"))]
compile_error!("looper requires epoll and eventfd and only builds on Linux");

pub(crate) mod common;

mod epoll;
mod unix;
mod waker;

pub use common::Events;

pub(crate) use common::{Event, millis_until};
pub(crate) use epoll::{EventBuffer, WAKE_SEQ};
pub(crate) use waker::Waker;

pub(crate) type Poller = epoll::EpollPoller;
