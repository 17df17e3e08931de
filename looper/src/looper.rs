use crate::builder::LooperBuilder;
use crate::error::{Error, Result};
use crate::message::{Message, MessageHandler};
use crate::poller::{Event, EventBuffer, Events, Poller, WAKE_SEQ, Waker, millis_until};
use crate::queue::MessageQueue;
use crate::watch::{Action, FdCallback, Pending, Request, Response, Watcher};

use log::{debug, error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of one [`Looper::poll_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The looper was woken with [`Looper::wake`] and nothing else
    /// happened.
    Woken,

    /// At least one descriptor callback or message handler ran.
    CallbackRan,

    /// The timeout elapsed with nothing to do.
    TimedOut,

    /// A watch added without a callback became ready.
    Ready(Response),
}

/// A per-thread event loop.
///
/// A `Looper` waits on a set of watched file descriptors and on a queue
/// of delayed messages at the same time, and sleeps in the kernel until
/// whichever comes first is ready.
///
/// One thread drives it through [`poll_once`](Self::poll_once) or
/// [`poll_all`](Self::poll_all). Every other operation, including
/// [`wake`](Self::wake), may be called from any thread, including while
/// the owner is blocked. Callbacks and message handlers run on the polling
/// thread with no internal lock held, so they may freely call back into
/// the looper.
///
/// # Examples
///
/// ```rust,ignore
/// use looper::{Looper, Message, MessageHandler, Poll};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let looper = Looper::new(false)?;
/// let handler: Arc<dyn MessageHandler> = Arc::new(|m: Message| println!("got {}", m.what));
///
/// looper.send_message_delayed(Duration::from_millis(50), &handler, Message::new(7));
/// assert_eq!(looper.poll_once(1000)?, Poll::CallbackRan);
/// ```
pub struct Looper {
    allow_non_callbacks: bool,

    /// Always registered in the current poller under [`WAKE_SEQ`].
    waker: Waker,

    /// Watch set and delayed messages. Never held across a kernel wait or
    /// a user callback.
    state: Mutex<State>,

    /// Owned by whichever thread is polling.
    dispatch: Mutex<Dispatch>,

    /// Set under the state lock once the wait timeout is computed, cleared
    /// when the kernel wait returns.
    polling: AtomicBool,
}

struct State {
    /// Shared with an in-progress wait so a rebuild can swap it out.
    poller: Arc<Poller>,

    requests: HashMap<RawFd, Request>,
    fds_by_seq: HashMap<u64, RawFd>,
    next_seq: u64,

    messages: MessageQueue,
    rebuild_required: bool,
}

struct Dispatch {
    buffer: EventBuffer,
    events: Vec<Event>,

    /// Ready callback-less watches not yet handed to the caller.
    responses: VecDeque<Pending>,
}

impl Looper {
    /// Creates a looper with the default configuration.
    ///
    /// `allow_non_callbacks` controls whether watches without a callback
    /// may be added; their readiness is returned from
    /// [`poll_once`](Self::poll_once) as [`Poll::Ready`].
    pub fn new(allow_non_callbacks: bool) -> Result<Self> {
        LooperBuilder::new()
            .allow_non_callbacks(allow_non_callbacks)
            .build()
    }

    pub(crate) fn with_config(allow_non_callbacks: bool, event_capacity: usize) -> Result<Self> {
        let waker = Waker::new()?;
        let poller = Poller::new(waker.as_raw_fd())?;

        debug!(
            "created looper (allow_non_callbacks = {allow_non_callbacks}, wake fd = {})",
            waker.as_raw_fd()
        );

        Ok(Self {
            allow_non_callbacks,
            waker,
            state: Mutex::new(State {
                poller: Arc::new(poller),
                requests: HashMap::new(),
                fds_by_seq: HashMap::new(),
                next_seq: 1,
                messages: MessageQueue::new(),
                rebuild_required: false,
            }),
            dispatch: Mutex::new(Dispatch {
                buffer: EventBuffer::with_capacity(event_capacity),
                events: Vec::with_capacity(event_capacity),
                responses: VecDeque::new(),
            }),
            polling: AtomicBool::new(false),
        })
    }

    /// Whether watches without a callback are accepted.
    pub fn allow_non_callbacks(&self) -> bool {
        self.allow_non_callbacks
    }

    /// Returns `true` while the polling thread is blocked in the kernel.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Waits for the next event and dispatches it.
    ///
    /// `timeout_ms` is `-1` to wait until something happens, `0` to poll
    /// without blocking, or a number of milliseconds. The wait is cut
    /// short by the earliest delayed message.
    ///
    /// Returns after at most one visible outcome:
    /// - [`Poll::Ready`] for each ready callback-less watch, one per call,
    /// - [`Poll::CallbackRan`] once callbacks and due messages ran,
    /// - [`Poll::Woken`] after a [`wake`](Self::wake) with nothing to do,
    /// - [`Poll::TimedOut`] when `timeout_ms` elapsed.
    ///
    /// # Errors
    ///
    /// [`Error::Wait`] if the kernel wait fails, [`Error::Setup`] if a
    /// requested rebuild cannot create a new epoll instance, and
    /// [`Error::Registration`] if a rebuild had to drop a watch the kernel
    /// no longer accepts. After a rebuild error the looper keeps working
    /// with the remaining watches.
    ///
    /// # Panics
    ///
    /// Panics raised by callbacks or message handlers propagate out of
    /// this call. The looper remains usable afterwards.
    pub fn poll_once(&self, timeout_ms: i32) -> Result<Poll> {
        let end = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let mut timeout_ms = timeout_ms;

        loop {
            let result = self.poll_inner(timeout_ms)?;
            if result != Poll::TimedOut || timeout_ms == 0 {
                return Ok(result);
            }

            // The wait was shortened for a message that is not due yet.
            if let Some(end) = end {
                timeout_ms = millis_until(Instant::now(), end);
                if timeout_ms == 0 {
                    return Ok(Poll::TimedOut);
                }
            }
        }
    }

    /// Like [`poll_once`](Self::poll_once) with a [`Duration`] timeout;
    /// `None` waits indefinitely.
    pub fn poll_once_timeout(&self, timeout: Option<Duration>) -> Result<Poll> {
        self.poll_once(timeout_to_millis(timeout))
    }

    /// Polls repeatedly until something other than callbacks happens.
    ///
    /// Keeps calling [`poll_once`](Self::poll_once) while it reports
    /// [`Poll::CallbackRan`]. A positive timeout bounds the whole call and
    /// yields [`Poll::TimedOut`] once it is used up.
    pub fn poll_all(&self, timeout_ms: i32) -> Result<Poll> {
        if timeout_ms <= 0 {
            loop {
                let result = self.poll_once(timeout_ms)?;
                if result != Poll::CallbackRan {
                    return Ok(result);
                }
            }
        }

        let end = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut timeout_ms = timeout_ms;

        loop {
            let result = self.poll_once(timeout_ms)?;
            if result != Poll::CallbackRan {
                return Ok(result);
            }

            timeout_ms = millis_until(Instant::now(), end);
            if timeout_ms == 0 {
                return Ok(Poll::TimedOut);
            }
        }
    }

    fn poll_inner(&self, timeout_ms: i32) -> Result<Poll> {
        let (mut result, callbacks) = {
            let mut guard = lock(&self.dispatch);
            let dispatch = &mut *guard;

            if let Some(response) = self.next_response(dispatch) {
                return Ok(Poll::Ready(response));
            }

            self.wait(dispatch, timeout_ms)?
        };

        if self.run_callbacks(callbacks) {
            result = Poll::CallbackRan;
        }
        if self.run_messages() {
            result = Poll::CallbackRan;
        }

        if let Some(response) = self.next_response(&mut lock(&self.dispatch)) {
            return Ok(Poll::Ready(response));
        }

        Ok(result)
    }

    /// Blocks in the kernel and sorts what it reports.
    ///
    /// Returns the provisional result and the ready callback watches;
    /// ready callback-less watches are queued on `dispatch.responses`.
    fn wait(&self, dispatch: &mut Dispatch, timeout_ms: i32) -> Result<(Poll, Vec<Pending>)> {
        let (poller, timeout_ms) = {
            let state = self.state();
            let mut timeout_ms = timeout_ms;

            if timeout_ms != 0 {
                if let Some(deadline) = state.messages.peek_deadline() {
                    let until = millis_until(Instant::now(), deadline);
                    if timeout_ms < 0 || until < timeout_ms {
                        timeout_ms = until;
                    }
                }
            }

            self.polling.store(true, Ordering::Release);

            (state.poller.clone(), timeout_ms)
        };

        trace!("waiting for events, timeout = {timeout_ms} ms");

        dispatch.events.clear();
        let waited = poller.wait(&mut dispatch.buffer, &mut dispatch.events, timeout_ms);
        self.polling.store(false, Ordering::Release);

        let mut state = self.state();

        // A failed wait leaves a pending rebuild for the next call.
        let ready = waited.map_err(Error::Wait)?;

        if state.rebuild_required {
            state.rebuild_required = false;
            self.waker.drain();
            self.rebuild_locked(&mut state)?;
            return Ok((Poll::Woken, Vec::new()));
        }

        if ready == 0 {
            return Ok((Poll::TimedOut, Vec::new()));
        }

        let mut callbacks = Vec::new();

        for event in dispatch.events.drain(..) {
            if event.seq == WAKE_SEQ {
                if event.events.contains(Events::INPUT) {
                    self.waker.drain();
                } else {
                    warn!("ignoring unexpected events {:?} on the wake fd", event.events);
                }
                continue;
            }

            let request = state
                .fds_by_seq
                .get(&event.seq)
                .and_then(|fd| state.requests.get(fd));

            let Some(request) = request else {
                warn!(
                    "ignoring events {:?} for stale sequence number {}",
                    event.events, event.seq
                );
                continue;
            };

            let pending = Pending {
                events: event.events,
                request: request.clone(),
            };

            match request.watcher {
                Watcher::Callback(_) => callbacks.push(pending),
                Watcher::Ident(_) => dispatch.responses.push_back(pending),
            }
        }

        Ok((Poll::Woken, callbacks))
    }

    fn run_callbacks(&self, ready: Vec<Pending>) -> bool {
        let mut ran = false;

        for pending in ready {
            let Watcher::Callback(callback) = &pending.request.watcher else {
                continue;
            };

            // An earlier callback in this batch may have removed or
            // replaced the watch.
            if !self.is_current(pending.request.seq) {
                continue;
            }

            let request = &pending.request;
            let action = callback.on_event(request.fd, pending.events, request.data);
            ran = true;

            if action == Action::Remove {
                self.remove_seq(request.seq);
            }
        }

        ran
    }

    fn run_messages(&self) -> bool {
        let mut ran = false;

        loop {
            let envelope = {
                let mut state = self.state();
                // Fresh clock per envelope.
                match state.messages.drain_due(Instant::now()).next() {
                    Some(envelope) => envelope,
                    None => break,
                }
            };

            envelope.deliver();
            ran = true;
        }

        ran
    }

    fn next_response(&self, dispatch: &mut Dispatch) -> Option<Response> {
        while let Some(pending) = dispatch.responses.pop_front() {
            if self.is_current(pending.request.seq) {
                return pending.response();
            }
        }

        None
    }

    /// Interrupts a blocked [`poll_once`](Self::poll_once), or makes the
    /// next one return immediately.
    ///
    /// Safe to call from any thread, any number of times. Wakes issued
    /// before the looper next drains the wake channel collapse into a
    /// single [`Poll::Woken`].
    pub fn wake(&self) {
        trace!("wake");
        self.waker.wake();
    }

    /// Adds `fd` to the watch set, or replaces its existing entry.
    ///
    /// With a callback, the callback runs during dispatch whenever the
    /// descriptor is ready for any of `events` (errors and hang-ups are
    /// always reported) and `ident` is ignored. Without one, readiness is
    /// returned from [`poll_once`](Self::poll_once) as [`Poll::Ready`]
    /// carrying `ident`, which must be `>= 0`, and the looper must have
    /// been created with `allow_non_callbacks`.
    ///
    /// `data` is handed back unchanged with every notification.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if the watch is not allowed or the kernel
    /// rejects the descriptor. Existing watches are unaffected.
    pub fn add_fd(
        &self,
        fd: RawFd,
        ident: i32,
        events: Events,
        callback: Option<Arc<dyn FdCallback>>,
        data: Option<usize>,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::invalid_watch(fd, "invalid file descriptor"));
        }

        let watcher = match callback {
            Some(callback) => Watcher::Callback(callback),
            None if !self.allow_non_callbacks => {
                return Err(Error::invalid_watch(
                    fd,
                    "a callback is required by this looper",
                ));
            }
            None if ident < 0 => {
                return Err(Error::invalid_watch(
                    fd,
                    "watches without a callback need an ident >= 0",
                ));
            }
            None => Watcher::Ident(ident),
        };

        let interest = events & (Events::INPUT | Events::OUTPUT);

        let mut state = self.state();

        let seq = state.next_seq;
        state.next_seq += 1;

        let request = Request {
            fd,
            seq,
            interest,
            watcher,
            data,
        };

        match state.requests.get(&fd).map(|r| r.seq) {
            None => {
                state
                    .poller
                    .add(fd, seq, interest)
                    .map_err(|e| Error::registration(fd, e))?;
            }
            Some(old_seq) => {
                match state.poller.modify(fd, seq, interest) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                        // Closed and reopened under the same number without
                        // being removed first.
                        debug!("fd {fd} was reused before removal, adding it again");
                        state
                            .poller
                            .add(fd, seq, interest)
                            .map_err(|e| Error::registration(fd, e))?;
                        self.schedule_rebuild_locked(&mut state);
                    }
                    Err(e) => return Err(Error::registration(fd, e)),
                }

                state.fds_by_seq.remove(&old_seq);
            }
        }

        trace!("watching {request:?}");

        state.fds_by_seq.insert(seq, fd);
        state.requests.insert(fd, request);

        Ok(())
    }

    /// Shorthand for [`add_fd`](Self::add_fd) with a callback.
    pub fn add_fd_with_callback(
        &self,
        fd: RawFd,
        events: Events,
        callback: Arc<dyn FdCallback>,
        data: Option<usize>,
    ) -> Result<()> {
        self.add_fd(fd, crate::POLL_CALLBACK, events, Some(callback), data)
    }

    /// Removes `fd` from the watch set.
    ///
    /// Returns `false` if it was not watched. A descriptor that was closed
    /// before being removed still counts as removed.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if the kernel refuses the removal for any
    /// other reason. The entry is dropped regardless.
    pub fn remove_fd(&self, fd: RawFd) -> Result<bool> {
        let mut state = self.state();
        self.remove_locked(&mut state, fd, None)
    }

    /// Returns `true` if `fd` is in the watch set.
    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.state().requests.contains_key(&fd)
    }

    /// Number of watched descriptors, not counting the wake channel.
    pub fn watch_count(&self) -> usize {
        self.state().requests.len()
    }

    fn remove_locked(&self, state: &mut State, fd: RawFd, seq: Option<u64>) -> Result<bool> {
        let current = match state.requests.get(&fd) {
            Some(request) => request.seq,
            None => return Ok(false),
        };

        if seq.is_some_and(|seq| seq != current) {
            return Ok(false);
        }

        state.requests.remove(&fd);
        state.fds_by_seq.remove(&current);

        trace!("no longer watching fd {fd}");

        match state.poller.delete(fd) {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT)) => {
                // Closed before removal; the kernel may still hold an entry
                // for the old open file description.
                debug!("fd {fd} was closed before removal");
                self.schedule_rebuild_locked(state);
                Ok(true)
            }
            Err(e) => {
                self.schedule_rebuild_locked(state);
                Err(Error::registration(fd, e))
            }
        }
    }

    fn remove_seq(&self, seq: u64) {
        let mut state = self.state();

        let Some(&fd) = state.fds_by_seq.get(&seq) else {
            return;
        };

        if let Err(e) = self.remove_locked(&mut state, fd, Some(seq)) {
            error!("callback asked to stop watching fd {fd}: {e}");
        }
    }

    fn is_current(&self, seq: u64) -> bool {
        self.state().fds_by_seq.contains_key(&seq)
    }

    /// Recreates the epoll instance from the current watch set.
    ///
    /// Needed when the kernel object is no longer trustworthy, typically in
    /// a child after `fork`. The rebuild happens on the polling thread the
    /// next time its wait returns; a blocked wait is woken for it.
    pub fn request_rebuild(&self) {
        let mut state = self.state();
        self.schedule_rebuild_locked(&mut state);
    }

    fn schedule_rebuild_locked(&self, state: &mut State) {
        if !state.rebuild_required {
            debug!("scheduling epoll rebuild");
            state.rebuild_required = true;
            self.waker.wake();
        }
    }

    fn rebuild_locked(&self, state: &mut State) -> Result<()> {
        debug!("rebuilding epoll set with {} watch(es)", state.requests.len());

        let poller = Poller::new(self.waker.as_raw_fd())?;
        let mut failed = Vec::new();

        for request in state.requests.values() {
            if let Err(e) = poller.add(request.fd, request.seq, request.interest) {
                error!(
                    "could not add fd {} while rebuilding epoll set: {e}",
                    request.fd
                );
                failed.push((request.fd, request.seq, e));
            }
        }

        state.poller = Arc::new(poller);

        // Rejected watches leave the set; the first rejection is reported.
        let mut first = None;
        for (fd, seq, e) in failed {
            state.requests.remove(&fd);
            state.fds_by_seq.remove(&seq);
            first.get_or_insert(Error::registration(fd, e));
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delivers `message` to `handler` as soon as possible.
    pub fn send_message(&self, handler: &Arc<dyn MessageHandler>, message: Message) {
        self.send_message_at_time(Instant::now(), handler, message);
    }

    /// Delivers `message` to `handler` no earlier than `delay` from now.
    ///
    /// A delay too large to represent as an [`Instant`] schedules the
    /// message so far ahead that it never comes due.
    pub fn send_message_delayed(
        &self,
        delay: Duration,
        handler: &Arc<dyn MessageHandler>,
        message: Message,
    ) {
        self.send_message_at_time(deadline_after(Instant::now(), delay), handler, message);
    }

    /// Delivers `message` to `handler` no earlier than `deadline`.
    ///
    /// Messages sharing a deadline are delivered in the order they were
    /// sent. A looper blocked on a later deadline is woken to recompute
    /// its timeout; one that is not blocked picks the message up the next
    /// time it computes one.
    pub fn send_message_at_time(
        &self,
        deadline: Instant,
        handler: &Arc<dyn MessageHandler>,
        message: Message,
    ) {
        let mut state = self.state();
        let is_head = state.messages.push(deadline, handler.clone(), message);

        // Not polling means the owner is dispatching or idle and reads the
        // queue head before its next wait.
        if is_head && self.polling.load(Ordering::Acquire) {
            self.waker.wake();
        }
    }

    /// Cancels every pending message addressed to `handler`.
    ///
    /// Returns how many were cancelled. A message whose handler is already
    /// running is not affected.
    pub fn remove_messages(&self, handler: &Arc<dyn MessageHandler>) -> usize {
        self.remove_messages_matching(handler, |_| true)
    }

    /// Cancels pending messages addressed to `handler` with the given
    /// `what`.
    pub fn remove_messages_what(&self, handler: &Arc<dyn MessageHandler>, what: i32) -> usize {
        self.remove_messages_matching(handler, |m| m.what == what)
    }

    /// Cancels pending messages addressed to `handler` for which `matches`
    /// returns `true`.
    pub fn remove_messages_matching<F>(&self, handler: &Arc<dyn MessageHandler>, matches: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let removed = self.state().messages.remove(handler, matches);
        if removed > 0 {
            trace!("cancelled {removed} message(s)");
        }

        removed
    }

    /// Returns `true` if a message with `what` is pending for `handler`.
    pub fn has_messages(&self, handler: &Arc<dyn MessageHandler>, what: i32) -> bool {
        self.state().messages.contains(handler, |m| m.what == what)
    }

    /// Number of delayed messages not yet delivered.
    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        debug!("destroying looper (wake fd = {})", self.waker.as_raw_fd());
    }
}

/// Locks `mutex`, ignoring poisoning.
///
/// No lock is held while user code runs, so a poisoned lock only means a
/// panic unwound through the looper between two consistent states.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stand-in for delays past the end of the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn timeout_to_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let now = Instant::now();
            millis_until(now, now + timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_timeouts_round_up() {
        assert_eq!(timeout_to_millis(None), -1);
        assert_eq!(timeout_to_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_to_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_to_millis(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn oversized_delays_saturate() {
        let now = Instant::now();

        assert_eq!(deadline_after(now, Duration::from_millis(5)), now + Duration::from_millis(5));
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(60 * 60 * 24 * 365));
    }
}
