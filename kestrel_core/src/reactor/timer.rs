//! Sorted timer queue backing the reactor's single timer descriptor.
//!
//! Two indices are kept in lockstep:
//! - `ordered`: a BTreeMap keyed by `(expiration_ns, id)`, so iteration yields
//!   timers in strict non-decreasing expiration order with ties broken by id.
//! - `by_id`: id -> expiration, giving O(log N) cancellation without scanning.
//!
//! Expirations are absolute CLOCK_MONOTONIC nanoseconds; the queue itself is
//! pure data and never touches the clock or the timer descriptor.

use std::collections::{BTreeMap, HashMap};

use super::EventLoop;

/// Opaque handle used to cancel a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

/// One-shot callbacks are consumed on fire; repeating ones are re-armed with
/// a drift-free `expiration += interval`.
pub(crate) enum TimerKind {
    Once(Box<dyn FnOnce(&EventLoop)>),
    Repeating {
        interval_ns: u64,
        callback: Box<dyn FnMut(&EventLoop)>,
    },
}

pub(crate) struct ExpiredTimer {
    pub id: TimerId,
    pub expiration_ns: u64,
    pub kind: TimerKind,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    ordered: BTreeMap<(u64, TimerId), TimerKind>,
    by_id: HashMap<TimerId, u64>,
}

impl TimerQueue {
    /// Insert a timer. Returns true when the new timer became the earliest
    /// (the caller must reprogram the timer descriptor).
    pub fn insert(&mut self, id: TimerId, expiration_ns: u64, kind: TimerKind) -> bool {
        let earliest_changed = match self.ordered.keys().next() {
            None => true,
            Some(&(head_exp, head_id)) => (expiration_ns, id) < (head_exp, head_id),
        };
        self.ordered.insert((expiration_ns, id), kind);
        self.by_id.insert(id, expiration_ns);
        earliest_changed
    }

    /// Remove a timer by id. Returns false when the id is unknown (already
    /// fired, cancelled, or never scheduled).
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.by_id.remove(&id) {
            Some(expiration_ns) => {
                self.ordered.remove(&(expiration_ns, id));
                true
            }
            None => false,
        }
    }

    /// Detach every timer with `expiration <= now_ns`, in firing order.
    ///
    /// Detaching before invoking is what makes callback re-entrancy safe: a
    /// callback that inserts or cancels timers operates on the live queue,
    /// never on the snapshot being iterated.
    pub fn take_expired(&mut self, now_ns: u64) -> Vec<ExpiredTimer> {
        // Everything strictly after (now, max id) stays queued.
        let later = self.ordered.split_off(&(now_ns + 1, TimerId(0)));
        let expired = std::mem::replace(&mut self.ordered, later);

        expired
            .into_iter()
            .map(|((expiration_ns, id), kind)| {
                self.by_id.remove(&id);
                ExpiredTimer {
                    id,
                    expiration_ns,
                    kind,
                }
            })
            .collect()
    }

    /// Absolute expiration of the earliest pending timer, if any.
    pub fn next_expiration_ns(&self) -> Option<u64> {
        self.ordered.keys().next().map(|&(exp, _)| exp)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerKind {
        TimerKind::Once(Box::new(|_| {}))
    }

    #[test]
    fn earliest_change_detection() {
        let mut q = TimerQueue::default();
        assert!(q.insert(TimerId(1), 100, noop()));
        assert!(!q.insert(TimerId(2), 200, noop()));
        assert!(q.insert(TimerId(3), 50, noop()));
        assert_eq!(q.next_expiration_ns(), Some(50));
    }

    #[test]
    fn expiry_order_breaks_ties_by_id() {
        let mut q = TimerQueue::default();
        q.insert(TimerId(9), 100, noop());
        q.insert(TimerId(3), 100, noop());
        q.insert(TimerId(5), 40, noop());

        let expired = q.take_expired(100);
        let ids: Vec<u64> = expired.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![5, 3, 9]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn take_expired_leaves_future_timers() {
        let mut q = TimerQueue::default();
        q.insert(TimerId(1), 10, noop());
        q.insert(TimerId(2), 20, noop());
        q.insert(TimerId(3), 30, noop());

        let expired = q.take_expired(20);
        assert_eq!(expired.len(), 2);
        assert_eq!(q.next_expiration_ns(), Some(30));
    }

    #[test]
    fn cancel_is_terminal() {
        let mut q = TimerQueue::default();
        q.insert(TimerId(1), 10, noop());
        assert!(q.cancel(TimerId(1)));
        assert!(!q.cancel(TimerId(1)));
        assert!(q.take_expired(100).is_empty());
    }
}
