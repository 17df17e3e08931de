//! Messages and their recipients.

use std::sync::Arc;

/// Payload delivered to a [`MessageHandler`].
///
/// `what` identifies the kind of message for the recipient and is what
/// [`Looper::remove_messages_what`](crate::Looper::remove_messages_what)
/// matches on. The two arguments are free for the recipient to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Message {
    pub what: i32,
    pub arg1: i64,
    pub arg2: i64,
}

impl Message {
    pub fn new(what: i32) -> Self {
        Self {
            what,
            ..Self::default()
        }
    }

    pub fn with_args(what: i32, arg1: i64, arg2: i64) -> Self {
        Self { what, arg1, arg2 }
    }
}

/// Recipient of delayed messages.
///
/// `handle_message` runs synchronously on the thread polling the looper,
/// with no looper lock held, so it may schedule or cancel messages and
/// add or remove watches on the same looper.
///
/// Any `Fn(Message)` closure that is `Send + Sync` is a handler.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn handle_message(&self, message: Message) {
        self(message)
    }
}

/// Returns `true` when `a` and `b` are the same recipient.
///
/// Recipients are compared by the address of the shared allocation, never
/// by value; the vtable half of the fat pointer is ignored since it is not
/// guaranteed to be unique.
pub(crate) fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
