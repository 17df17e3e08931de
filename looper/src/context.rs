//! Per-thread looper registry.
//!
//! Each thread holds at most one looper reference in thread-local
//! storage. The reference is released when the thread exits, so a looper
//! lives as long as its thread or any other handle still pointing at it.

use crate::error::Result;
use crate::looper::Looper;

use log::{debug, warn};
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// The looper associated with the current thread, if any.
    static CURRENT_LOOPER: RefCell<Option<Arc<Looper>>> = const { RefCell::new(None) };
}

impl Looper {
    /// Returns the looper associated with the calling thread.
    pub fn for_thread() -> Option<Arc<Looper>> {
        CURRENT_LOOPER.with(|current| current.borrow().clone())
    }

    /// Associates `looper` with the calling thread, returning the looper
    /// it replaces.
    ///
    /// Passing `None` clears the association.
    pub fn set_for_thread(looper: Option<Arc<Looper>>) -> Option<Arc<Looper>> {
        let previous = CURRENT_LOOPER.with(|current| current.replace(looper));

        if previous.is_some() {
            debug!("replaced the looper of {:?}", std::thread::current().id());
        }

        previous
    }

    /// Returns the calling thread's looper, creating and associating one
    /// first if there is none.
    ///
    /// An existing looper is returned as is, even if it was created with a
    /// different `allow_non_callbacks` setting.
    ///
    /// # Errors
    ///
    /// [`Error::Setup`](crate::Error::Setup) if a new looper cannot be
    /// created.
    pub fn prepare(allow_non_callbacks: bool) -> Result<Arc<Looper>> {
        if let Some(looper) = Self::for_thread() {
            if looper.allow_non_callbacks() != allow_non_callbacks {
                warn!(
                    "thread looper already exists with allow_non_callbacks = {}, ignoring {}",
                    looper.allow_non_callbacks(),
                    allow_non_callbacks
                );
            }
            return Ok(looper);
        }

        let looper = Arc::new(Looper::new(allow_non_callbacks)?);
        Self::set_for_thread(Some(looper.clone()));

        Ok(looper)
    }

    /// Runs `f` with `looper` associated with the calling thread, then
    /// restores whatever was associated before.
    pub fn enter<R>(looper: Arc<Looper>, f: impl FnOnce() -> R) -> R {
        let previous = Self::set_for_thread(Some(looper));
        let _restore = Restore(previous);

        f()
    }
}

/// Puts back the previous thread looper, also when `f` unwinds.
struct Restore(Option<Arc<Looper>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_LOOPER.with(|current| *current.borrow_mut() = previous);
    }
}
