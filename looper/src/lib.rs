//! # Looper
//!
//! **Looper** is a single-threaded, per-thread event loop. It waits on a set
//! of file descriptors and on a queue of delayed messages at the same time,
//! sleeping in the kernel until exactly the moment the next one is ready.
//!
//! It is the engine beneath message-passing APIs such as a UI-thread
//! dispatcher: one thread owns the loop and calls
//! [`poll_once`](Looper::poll_once), while any thread can schedule
//! messages, change the watch set, or [`wake`](Looper::wake) it.
//!
//! Built on Linux primitives:
//!
//! - an **`epoll`** instance holding the watch set,
//! - an **`eventfd`** wake channel that coalesces any number of wakes,
//! - a **monotonic** deadline queue for delayed messages.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use looper::{Looper, Message, MessageHandler, Poll};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let looper = Looper::prepare(false)?;
//!
//! let handler: Arc<dyn MessageHandler> = Arc::new(|message: Message| {
//!     println!("message {}", message.what);
//! });
//!
//! looper.send_message_delayed(Duration::from_millis(100), &handler, Message::new(1));
//!
//! while looper.poll_once(-1)? != Poll::CallbackRan {}
//! ```
//!
//! ## Modules
//!
//! - [`Looper`]: the event loop and its per-thread registry
//! - [`LooperBuilder`]: configuration
//! - [`Events`]: readiness conditions
//! - [`Message`] / [`MessageHandler`]: delayed messages and recipients
//! - [`FdCallback`] / [`Response`]: descriptor notifications

mod builder;
mod context;
mod error;
mod looper;
mod message;
mod poller;
mod queue;
mod watch;

pub use builder::LooperBuilder;
pub use error::{Error, Result};
pub use looper::{Looper, Poll};
pub use message::{Message, MessageHandler};
pub use poller::Events;
pub use watch::{Action, FdCallback, POLL_CALLBACK, Response};
