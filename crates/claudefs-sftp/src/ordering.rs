//! Per-handle arrival-order serialization.
//!
//! Reads, writes, fstat and fsetstat on the same handle must complete in the
//! order they arrived on the wire even though they run on different worker
//! threads. The read loop registers each such job before submitting it; the
//! dispatcher then waits for the job's turn and holds a [`Turn`] guard while
//! the handler runs. Dropping the guard advances the queue, including on
//! handler error or panic.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// Wire handle string used as the serialization key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey(Bytes);

impl HandleKey {
    /// Wraps raw handle bytes.
    pub fn new(handle: Bytes) -> Self {
        Self(handle)
    }

    /// The raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

struct HandleQueue {
    pending: Mutex<VecDeque<u64>>,
    turn: Condvar,
}

impl HandleQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            turn: Condvar::new(),
        }
    }
}

/// A registered job's place in its handle's queue.
#[derive(Debug)]
pub struct Ticket {
    handle: HandleKey,
    token: u64,
}

impl Ticket {
    /// The handle this ticket is queued on.
    pub fn handle(&self) -> &HandleKey {
        &self.handle
    }

    /// The job token.
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Tracks pending handle-affecting jobs, one FIFO per handle.
///
/// Handles with nothing pending have no entry.
pub struct OrderingTracker {
    queues: DashMap<HandleKey, Arc<HandleQueue>>,
}

impl OrderingTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Appends `token` to `handle`'s queue.
    ///
    /// Called from the read loop before the job is submitted, so queue order
    /// is wire arrival order. Tokens must increase monotonically.
    pub fn register(&self, handle: HandleKey, token: u64) -> Ticket {
        // Push while the shard lock is held so a concurrent `complete` cannot
        // drop the entry between lookup and push.
        let queue = self
            .queues
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(HandleQueue::new()));
        queue.pending.lock().push_back(token);
        drop(queue);
        trace!(token, "registered serializable job");
        Ticket { handle, token }
    }

    fn queue(&self, handle: &HandleKey) -> Option<Arc<HandleQueue>> {
        self.queues.get(handle).map(|q| Arc::clone(q.value()))
    }

    /// Blocks until `ticket` heads its handle's queue.
    pub fn wait_for_turn(&self, ticket: Ticket) -> Turn<'_> {
        match self.queue(&ticket.handle) {
            Some(queue) => {
                let mut pending = queue.pending.lock();
                while pending.front() != Some(&ticket.token) {
                    if !pending.contains(&ticket.token) {
                        warn!(token = ticket.token, "ticket missing from its handle queue");
                        break;
                    }
                    queue.turn.wait(&mut pending);
                }
            }
            None => warn!(token = ticket.token, "wait on untracked handle"),
        }
        Turn {
            tracker: self,
            ticket,
        }
    }

    /// Blocks until every job registered on `handle` with a token below
    /// `before` has completed. Used by close so it cannot overtake earlier
    /// operations on the same handle.
    pub fn wait_drained(&self, handle: &HandleKey, before: u64) {
        let Some(queue) = self.queue(handle) else {
            return;
        };
        let mut pending = queue.pending.lock();
        while pending.front().is_some_and(|front| *front < before) {
            queue.turn.wait(&mut pending);
        }
    }

    fn complete(&self, ticket: &Ticket) {
        let Some(queue) = self.queue(&ticket.handle) else {
            return;
        };
        {
            let mut pending = queue.pending.lock();
            if pending.front() == Some(&ticket.token) {
                pending.pop_front();
            } else if let Some(pos) = pending.iter().position(|t| *t == ticket.token) {
                pending.remove(pos);
            }
        }
        queue.turn.notify_all();
        self.queues
            .remove_if(&ticket.handle, |_, q| q.pending.lock().is_empty());
        trace!(token = ticket.token, "completed serializable job");
    }

    /// Jobs pending on `handle`.
    pub fn pending(&self, handle: &HandleKey) -> usize {
        self.queue(handle).map(|q| q.pending.lock().len()).unwrap_or(0)
    }

    /// Handles with at least one pending job.
    pub fn tracked_handles(&self) -> usize {
        self.queues.len()
    }
}

impl Default for OrderingTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a job is at the head of its handle's queue.
///
/// Dropping it removes the job and releases the next one.
pub struct Turn<'a> {
    tracker: &'a OrderingTracker,
    ticket: Ticket,
}

impl Turn<'_> {
    /// The ticket this turn was granted for.
    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.tracker.complete(&self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn key(b: &'static [u8]) -> HandleKey {
        HandleKey::new(Bytes::from_static(b))
    }

    #[test]
    fn test_register_and_complete_gc() {
        let tracker = OrderingTracker::new();
        let t = tracker.register(key(b"h1"), 1);
        assert_eq!(tracker.pending(&key(b"h1")), 1);
        assert_eq!(tracker.tracked_handles(), 1);
        drop(tracker.wait_for_turn(t));
        assert_eq!(tracker.pending(&key(b"h1")), 0);
        assert_eq!(tracker.tracked_handles(), 0);
    }

    #[test]
    fn test_head_gets_turn_immediately() {
        let tracker = OrderingTracker::new();
        let t1 = tracker.register(key(b"h"), 1);
        let _t2 = tracker.register(key(b"h"), 2);
        let turn = tracker.wait_for_turn(t1);
        assert_eq!(turn.ticket().token(), 1);
        assert_eq!(tracker.pending(&key(b"h")), 2);
    }

    #[test]
    fn test_same_handle_completes_in_arrival_order() {
        let tracker = Arc::new(OrderingTracker::new());
        let t1 = tracker.register(key(b"h"), 1);
        let t2 = tracker.register(key(b"h"), 2);
        let (tx, rx) = mpsc::channel();

        let second = {
            let tracker = Arc::clone(&tracker);
            let tx = tx.clone();
            thread::spawn(move || {
                let _turn = tracker.wait_for_turn(t2);
                tx.send(2).unwrap();
            })
        };

        // Job 2 is blocked while job 1 dawdles.
        let turn = tracker.wait_for_turn(t1);
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
        tx.send(1).unwrap();
        drop(turn);

        second.join().unwrap();
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(tracker.tracked_handles(), 0);
    }

    #[test]
    fn test_different_handles_do_not_serialize() {
        let tracker = Arc::new(OrderingTracker::new());
        let t1 = tracker.register(key(b"a"), 1);
        let t2 = tracker.register(key(b"b"), 2);
        let _held = tracker.wait_for_turn(t1);

        let (tx, rx) = mpsc::channel();
        let other = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let _turn = tracker.wait_for_turn(t2);
                tx.send(()).unwrap();
            })
        };
        rx.recv_timeout(Duration::from_secs(5))
            .expect("job on another handle was blocked");
        other.join().unwrap();
    }

    #[test]
    fn test_turn_released_on_panic() {
        let tracker = Arc::new(OrderingTracker::new());
        let t1 = tracker.register(key(b"h"), 1);
        let t2 = tracker.register(key(b"h"), 2);

        let panicking = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let _turn = tracker.wait_for_turn(t1);
                panic!("handler blew up");
            })
        };
        assert!(panicking.join().is_err());

        let turn = tracker.wait_for_turn(t2);
        assert_eq!(turn.ticket().token(), 2);
    }

    #[test]
    fn test_wait_drained_waits_for_earlier_jobs_only() {
        let tracker = Arc::new(OrderingTracker::new());
        let t1 = tracker.register(key(b"h"), 1);
        let _t5 = tracker.register(key(b"h"), 5);
        let (tx, rx) = mpsc::channel();

        let closer = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                tracker.wait_drained(&key(b"h"), 3);
                tx.send(()).unwrap();
            })
        };

        let turn = tracker.wait_for_turn(t1);
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        drop(turn);

        rx.recv_timeout(Duration::from_secs(5))
            .expect("close not released after earlier job completed");
        closer.join().unwrap();
        assert_eq!(tracker.pending(&key(b"h")), 1);
    }

    #[test]
    fn test_wait_drained_untracked_handle_returns() {
        let tracker = OrderingTracker::new();
        tracker.wait_drained(&key(b"none"), 10);
    }

    #[test]
    fn test_many_jobs_interleaved_threads() {
        let tracker = Arc::new(OrderingTracker::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let tickets: Vec<Ticket> = (0..16).map(|i| tracker.register(key(b"h"), i)).collect();

        let handles: Vec<_> = tickets
            .into_iter()
            .rev()
            .map(|ticket| {
                let tracker = Arc::clone(&tracker);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    let turn = tracker.wait_for_turn(ticket);
                    log.lock().push(turn.ticket().token());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*log.lock(), (0..16).collect::<Vec<u64>>());
        assert_eq!(tracker.tracked_handles(), 0);
    }
}
