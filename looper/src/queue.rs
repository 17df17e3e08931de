use crate::message::{Message, MessageHandler, same_handler};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

/// A message waiting in the delayed queue.
///
/// Envelopes are ordered by deadline, then by the order they were
/// scheduled in, so messages sharing a deadline come out first-in
/// first-out.
pub(crate) struct Envelope {
    /// Earliest time the message may be delivered.
    pub(crate) deadline: Instant,

    /// Scheduling order, used to break deadline ties.
    seq: u64,

    /// Recipient of the message.
    pub(crate) handler: Arc<dyn MessageHandler>,

    pub(crate) message: Message,
}

impl Envelope {
    /// Hands the message to its recipient, consuming the envelope.
    pub(crate) fn deliver(self) {
        self.handler.handle_message(self.message);
    }

    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

impl Eq for Envelope {}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Ord for Envelope {
    /// Reversed so that a `BinaryHeap<Envelope>` pops the earliest
    /// deadline (and, among equals, the oldest envelope) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed messages ordered by deadline.
///
/// Backed by a min-heap: insertion and removal of the head are
/// `O(log n)`, cancellation is a linear sweep.
pub(crate) struct MessageQueue {
    heap: BinaryHeap<Envelope>,
    next_seq: u64,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedules `message` for `handler` at `deadline`.
    ///
    /// Returns `true` if the new envelope is now the earliest one, meaning
    /// a sleeping looper has to recompute its timeout.
    pub(crate) fn push(
        &mut self,
        deadline: Instant,
        handler: Arc<dyn MessageHandler>,
        message: Message,
    ) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Envelope {
            deadline,
            seq,
            handler,
            message,
        });

        self.heap.peek().is_some_and(|head| head.seq == seq)
    }

    /// Deadline of the earliest envelope, if any.
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Removes and returns the earliest envelope if it is due at `now`.
    fn pop_due(&mut self, now: Instant) -> Option<Envelope> {
        if self.heap.peek()?.deadline > now {
            return None;
        }

        self.heap.pop()
    }

    /// Drains every envelope due at `now`, earliest first.
    ///
    /// The iterator is lazy: envelopes not yet pulled from it stay queued,
    /// and `now` is fixed for its whole life. Callers that must not run
    /// late messages against a stale clock take a fresh drain per envelope.
    pub(crate) fn drain_due(&mut self, now: Instant) -> DrainDue<'_> {
        DrainDue { queue: self, now }
    }

    /// Drops every envelope addressed to `handler` whose message satisfies
    /// `matches`, returning how many were dropped.
    pub(crate) fn remove<F>(&mut self, handler: &Arc<dyn MessageHandler>, mut matches: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let before = self.heap.len();

        self.heap
            .retain(|e| !(same_handler(&e.handler, handler) && matches(&e.message)));

        before - self.heap.len()
    }

    /// Returns `true` if an envelope for `handler` satisfies `matches`.
    pub(crate) fn contains<F>(&self, handler: &Arc<dyn MessageHandler>, mut matches: F) -> bool
    where
        F: FnMut(&Message) -> bool,
    {
        self.heap
            .iter()
            .any(|e| same_handler(&e.handler, handler) && matches(&e.message))
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Iterator returned by [`MessageQueue::drain_due`].
pub(crate) struct DrainDue<'a> {
    queue: &'a mut MessageQueue,
    now: Instant,
}

impl Iterator for DrainDue<'_> {
    type Item = Envelope;

    fn next(&mut self) -> Option<Envelope> {
        self.queue.pop_due(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder() -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn MessageHandler> =
            Arc::new(move |m: Message| sink.lock().unwrap().push(m.what));

        (handler, seen)
    }

    #[test]
    fn drains_in_deadline_order() {
        let (handler, seen) = recorder();
        let base = Instant::now();
        let mut queue = MessageQueue::new();

        for (what, ms) in [(3, 30), (1, 10), (4, 40), (2, 20)] {
            queue.push(base + Duration::from_millis(ms), handler.clone(), Message::new(what));
        }

        let deadlines: Vec<_> = queue
            .drain_due(base + Duration::from_millis(40))
            .map(|e| {
                let deadline = e.deadline;
                e.deliver();
                deadline
            })
            .collect();

        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn equal_deadlines_keep_scheduling_order() {
        let (handler, seen) = recorder();
        let deadline = Instant::now();
        let mut queue = MessageQueue::new();

        for what in 0..8 {
            queue.push(deadline, handler.clone(), Message::new(what));
        }

        for envelope in queue.drain_due(deadline) {
            envelope.deliver();
        }

        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn never_yields_future_entries() {
        let (handler, _) = recorder();
        let base = Instant::now();
        let mut queue = MessageQueue::new();

        queue.push(base + Duration::from_millis(5), handler.clone(), Message::new(1));
        queue.push(base + Duration::from_millis(50), handler.clone(), Message::new(2));

        let now = base + Duration::from_millis(10);
        let due: Vec<_> = queue.drain_due(now).map(|e| e.deadline).collect();

        assert_eq!(due.len(), 1);
        assert!(due.iter().all(|d| *d <= now));
        assert_eq!(queue.peek_deadline(), Some(base + Duration::from_millis(50)));
    }

    #[test]
    fn push_reports_new_head() {
        let (handler, _) = recorder();
        let base = Instant::now();
        let mut queue = MessageQueue::new();

        assert!(queue.push(base + Duration::from_millis(20), handler.clone(), Message::new(1)));
        assert!(!queue.push(base + Duration::from_millis(30), handler.clone(), Message::new(2)));
        assert!(!queue.push(base + Duration::from_millis(20), handler.clone(), Message::new(3)));
        assert!(queue.push(base + Duration::from_millis(10), handler.clone(), Message::new(4)));
    }

    #[test]
    fn remove_only_touches_matching_recipient() {
        let (first, _) = recorder();
        let (second, _) = recorder();
        let now = Instant::now();
        let mut queue = MessageQueue::new();

        queue.push(now, first.clone(), Message::new(1));
        queue.push(now, first.clone(), Message::new(2));
        queue.push(now, second.clone(), Message::new(1));

        assert_eq!(queue.remove(&first, |m| m.what == 1), 1);
        assert!(queue.contains(&first, |m| m.what == 2));
        assert!(queue.contains(&second, |m| m.what == 1));
        assert_eq!(queue.remove(&first, |_| true), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn partially_consumed_drain_leaves_the_rest() {
        let (handler, _) = recorder();
        let now = Instant::now();
        let mut queue = MessageQueue::new();

        for what in 0..3 {
            queue.push(now, handler.clone(), Message::new(what));
        }

        let first = queue.drain_due(now).next().map(|e| e.message.what);

        assert_eq!(first, Some(0));
        assert_eq!(queue.len(), 2);
    }
}
