//! A single shared timer wheel, stood in for by a min-heap of deadlines.
//!
//! Every per-connection idle timeout, handshake timeout, and drain grace
//! timer in the crate goes through one `TimerWheel` per worker. Cancellation
//! is lazy: a cancelled id is remembered and skipped when it surfaces from
//! the heap, rather than walked out of the heap eagerly.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Opaque handle to a scheduled timer. Zero is never issued, so `Option<TimerId>`
/// and a sentinel both work as call sites prefer.
pub type TimerId = u64;

pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    cancelled: HashSet<TimerId>,
    next_id: TimerId,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 1,
        }
    }

    /// Schedules a firing `after` the given duration and returns its id.
    /// Callers are expected to have already filtered out `duration <= 0`;
    /// the timer wheel itself is considered infallible, per the manager's
    /// failure semantics.
    pub fn schedule(&mut self, after: Duration) -> TimerId {
        self.schedule_at(Instant::now() + after)
    }

    pub fn schedule_at(&mut self, deadline: Instant) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// The next deadline still live in the wheel, used to size the event
    /// loop's poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if self.cancelled.remove(&id) {
                self.heap.pop();
                continue;
            }
            return Some(deadline);
        }
        None
    }

    /// Pops every timer id whose deadline has passed `now`, skipping
    /// cancelled ones.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.cancelled.remove(&id) {
                continue;
            }
            fired.push(id);
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(Duration::from_millis(30));
        let b = wheel.schedule(Duration::from_millis(10));
        let c = wheel.schedule(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        let fired = wheel.pop_expired(Instant::now());
        assert_eq!(fired, vec![b, c, a]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new();
        let id = wheel.schedule(Duration::from_millis(1));
        wheel.cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.pop_expired(Instant::now()).is_empty());
    }
}
