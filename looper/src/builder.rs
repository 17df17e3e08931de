use crate::error::Result;
use crate::looper::Looper;

/// Default number of readiness records read per kernel wait.
const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Builder for configuring and creating a [`Looper`].
///
/// # Examples
///
/// ```rust,ignore
/// let looper = LooperBuilder::new()
///     .allow_non_callbacks(true)
///     .event_capacity(64)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct LooperBuilder {
    /// Whether watches may be added without a callback.
    allow_non_callbacks: bool,

    /// Capacity of the buffer handed to `epoll_wait`.
    event_capacity: usize,
}

impl LooperBuilder {
    /// Creates a builder that requires callbacks and reads up to 16
    /// readiness records per wait.
    pub fn new() -> Self {
        Self {
            allow_non_callbacks: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Accepts watches without a callback, reported through
    /// [`Poll::Ready`](crate::Poll::Ready).
    pub fn allow_non_callbacks(mut self, allow: bool) -> Self {
        self.allow_non_callbacks = allow;
        self
    }

    /// Sets how many readiness records a single wait may return.
    ///
    /// Descriptors that are ready beyond this limit are reported by the
    /// next wait.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "event_capacity must be > 0");

        self.event_capacity = capacity;
        self
    }

    /// Builds the looper.
    ///
    /// # Errors
    ///
    /// [`Error::Setup`](crate::Error::Setup) if the wake channel or the
    /// epoll instance cannot be created.
    pub fn build(self) -> Result<Looper> {
        Looper::with_config(self.allow_non_callbacks, self.event_capacity)
    }
}

impl Default for LooperBuilder {
    fn default() -> Self {
        Self::new()
    }
}
