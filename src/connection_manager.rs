//! Per-worker registry of live connections: idle-timer integration, an
//! intrusive busy/idle partition for LRU-style eviction, and a two-phase
//! graceful-drain state machine.
//!
//! Storage is an arena (`slab::Slab`) of nodes linked by prev/next indices —
//! the "pointer-stable storage (arena + index)" representation called for
//! by the design notes, since Rust's ownership rules make real intrusive
//! pointers impractical here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::connection::{Connection, DropReason};
use crate::timer::{TimerId, TimerWheel};

pub type ConnKey = usize;

struct Node<C> {
    conn: C,
    prev: Option<ConnKey>,
    next: Option<ConnKey>,
    timer: Option<TimerId>,
    /// Timestamp of the node's last activation/deactivation transition.
    /// While idle, `now - since` is the idle duration used by
    /// `drop_idle_connections` and the early-drop threshold check.
    since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainPhase {
    None,
    NotifyPendingShutdown,
    NotifyPendingShutdownComplete,
    CloseWhenIdle,
    CloseWhenIdleComplete,
}

/// Bounded work quantum: the manager processes at most this many
/// connections per drain step, re-scheduling itself to continue on the next
/// event-loop iteration rather than blocking it.
const DRAIN_BATCH_SIZE: usize = 64;

struct DrainState {
    phase: DrainPhase,
    /// Cursor into the connection list marking the next node the drain
    /// iteration will visit. Advanced before any erase/move that could
    /// invalidate it.
    cursor: Option<ConnKey>,
    /// First node *not* covered by a partial drain (i.e. the drain only
    /// processes nodes from `cursor` to the tail). `None` means "whole list."
    grace_timer: Option<TimerId>,
}

impl Default for DrainState {
    fn default() -> Self {
        DrainState {
            phase: DrainPhase::None,
            cursor: None,
            grace_timer: None,
        }
    }
}

/// Tracks all live connections of one worker.
pub struct ConnectionManager<C> {
    nodes: Slab<Node<C>>,
    head: Option<ConnKey>,
    tail: Option<ConnKey>,
    /// First idle node, or `None` iff there are no idle connections.
    idle_cursor: Option<ConnKey>,
    idle_timeout: Duration,
    early_drop_threshold: Duration,
    drain: DrainState,
    on_empty_fired_pending: bool,
    /// Reverse index from a scheduled timer id back to its connection and
    /// the reason it should report if the timer fires, so a firing timer
    /// can be resolved in O(1) rather than by scanning every node.
    timer_owner: HashMap<TimerId, (ConnKey, DropReason)>,
}

impl<C: Connection> ConnectionManager<C> {
    pub fn new(idle_timeout: Duration) -> Self {
        ConnectionManager {
            nodes: Slab::new(),
            head: None,
            tail: None,
            idle_cursor: None,
            idle_timeout,
            early_drop_threshold: idle_timeout / 2,
            drain: DrainState::default(),
            on_empty_fired_pending: false,
            timer_owner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: ConnKey) -> Option<&C> {
        self.nodes.get(key).map(|n| &n.conn)
    }

    pub fn get_mut(&mut self, key: ConnKey) -> Option<&mut C> {
        self.nodes.get_mut(key).map(|n| &mut n.conn)
    }

    /// Registers `conn`, inserting it at the busy front. If `arm_timeout`,
    /// schedules the idle timer. If a graceful shutdown has reached
    /// "notify pending," delivers that notification immediately; if it has
    /// reached "close when idle," the delivery happens on the *next* drain
    /// tick rather than synchronously, so a connection added mid-add is not
    /// torn down before its caller finishes wiring it up.
    pub fn add(&mut self, conn: C, arm_timeout: bool, wheel: &mut TimerWheel) -> ConnKey {
        let key = self.nodes.insert(Node {
            conn,
            prev: None,
            next: None,
            timer: None,
            since: Instant::now(),
        });
        self.push_front(key);
        if arm_timeout {
            self.schedule_timeout(key, self.idle_timeout, DropReason::IdleTimeout, wheel);
        }
        match self.drain.phase {
            DrainPhase::NotifyPendingShutdown | DrainPhase::NotifyPendingShutdownComplete => {
                self.nodes[key].conn.notify_pending_shutdown();
            }
            DrainPhase::CloseWhenIdle | DrainPhase::CloseWhenIdleComplete => {
                // Deferred: the next drain_tick() will visit this node since
                // it was just linked at the head, ahead of the cursor.
            }
            DrainPhase::None => {}
        }
        key
    }

    /// Cancels the timer, unlinks, and fires the empty notification exactly
    /// once on a non-empty → empty transition. A no-op if `key` isn't
    /// tracked.
    pub fn remove(&mut self, key: ConnKey, wheel: &mut TimerWheel) {
        if !self.nodes.contains(key) {
            return;
        }
        if let Some(timer) = self.nodes[key].timer.take() {
            wheel.cancel(timer);
            self.timer_owner.remove(&timer);
        }
        self.unlink(key);
        self.nodes.remove(key);
        if self.nodes.is_empty() {
            self.on_empty_fired_pending = true;
        }
    }

    /// Consumes and reports whether the manager just transitioned to empty
    /// since the last call, so callers (the Acceptor's `checkDrained`) can
    /// react exactly once per transition.
    pub fn take_empty_notification(&mut self) -> bool {
        std::mem::take(&mut self.on_empty_fired_pending)
    }

    /// No-op if `duration` is zero or negative; the timer wheel is
    /// considered infallible so scheduling failures aren't modeled. `reason`
    /// is what the connection is told if this timer is the one that fires
    /// (idle timeout vs. handshake timeout share this same mechanism).
    pub fn schedule_timeout(
        &mut self,
        key: ConnKey,
        duration: Duration,
        reason: DropReason,
        wheel: &mut TimerWheel,
    ) {
        if duration.is_zero() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(key) {
            if let Some(old) = node.timer.take() {
                wheel.cancel(old);
                self.timer_owner.remove(&old);
            }
            let id = wheel.schedule(duration);
            node.timer = Some(id);
            self.timer_owner.insert(id, (key, reason));
        }
    }

    /// Looks up which connection a scheduled timer id belongs to, without
    /// consuming it.
    pub fn timer_key(&self, id: TimerId) -> Option<ConnKey> {
        self.timer_owner.get(&id).map(|(key, _)| *key)
    }

    /// Resolves a fired timeout timer id to its connection, drops it with
    /// its registered reason, and removes it. Returns `true` if `id`
    /// belonged to a tracked connection's timer.
    pub fn handle_idle_timeout(&mut self, id: TimerId, wheel: &mut TimerWheel) -> bool {
        let Some((key, reason)) = self.timer_owner.remove(&id) else {
            return false;
        };
        if !self.nodes.contains(key) {
            return false;
        }
        self.nodes[key].conn.drop_connection(reason);
        self.remove(key, wheel);
        true
    }

    /// Moves `conn` to the busy front. Advances the idle cursor first if it
    /// pointed at `key`.
    pub fn on_activated(&mut self, key: ConnKey) {
        if !self.nodes.contains(key) {
            return;
        }
        self.unlink(key);
        self.push_front(key);
        self.nodes[key].since = Instant::now();
    }

    /// Moves `conn` to the idle tail (MRU of idle). If there were no idle
    /// connections before, `key` becomes the new idle cursor.
    pub fn on_deactivated(&mut self, key: ConnKey) {
        if !self.nodes.contains(key) {
            return;
        }
        let had_no_idle = self.idle_cursor.is_none();
        self.unlink(key);
        self.push_back(key);
        self.nodes[key].since = Instant::now();
        if had_no_idle {
            self.idle_cursor = Some(key);
        }
    }

    /// Begins (or continues, idempotently) a full graceful shutdown.
    /// `idle_grace == 0` skips directly to the close-when-idle phase.
    pub fn initiate_graceful_shutdown(&mut self, idle_grace: Duration, wheel: &mut TimerWheel) {
        if self.drain.phase != DrainPhase::None {
            return;
        }
        self.drain.cursor = self.head;
        self.start_drain(idle_grace, wheel);
    }

    /// Same two-phase protocol, but only over the tail fraction of the list:
    /// starts `ceil(len * (1 - fraction))` nodes in from the front. Ignored
    /// if a full drain is already in progress.
    pub fn drain_connections(&mut self, fraction: f64, idle_grace: Duration, wheel: &mut TimerWheel) {
        if self.drain.phase != DrainPhase::None {
            return;
        }
        let len = self.nodes.len();
        let skip = ((len as f64) * (1.0 - fraction)).ceil() as usize;
        let mut cursor = self.head;
        for _ in 0..skip {
            match cursor {
                Some(k) => cursor = self.nodes[k].next,
                None => break,
            }
        }
        self.drain.cursor = cursor;
        self.start_drain(idle_grace, wheel);
    }

    fn start_drain(&mut self, idle_grace: Duration, wheel: &mut TimerWheel) {
        if idle_grace.is_zero() {
            self.drain.phase = DrainPhase::CloseWhenIdle;
        } else {
            self.drain.phase = DrainPhase::NotifyPendingShutdown;
            self.drain.grace_timer = Some(wheel.schedule(idle_grace));
        }
    }

    /// Call when `timer_id` fires. If it's the active grace timer and the
    /// notify pass already finished, transitions to close-when-idle
    /// immediately; otherwise the transition happens once the in-progress
    /// notify pass completes.
    pub fn grace_timer_expired(&mut self, timer_id: TimerId) {
        if self.drain.grace_timer != Some(timer_id) {
            return;
        }
        self.drain.grace_timer = None;
        match self.drain.phase {
            DrainPhase::NotifyPendingShutdownComplete => {
                self.drain.phase = DrainPhase::CloseWhenIdle;
                self.drain.cursor = self.head;
            }
            DrainPhase::NotifyPendingShutdown => {
                // Notify pass still running; drain_tick() will observe the
                // timer already consumed and advance the phase itself.
            }
            _ => {}
        }
    }

    /// Processes up to `DRAIN_BATCH_SIZE` connections of the active drain
    /// phase. Returns `true` once the manager has nothing left to drain
    /// (phase is `None` or both passes completed and the grace timer, if
    /// any, already fired).
    pub fn drain_tick(&mut self) -> bool {
        match self.drain.phase {
            DrainPhase::None => true,
            DrainPhase::NotifyPendingShutdown => {
                let done = self.walk_drain_batch(|conn| conn.notify_pending_shutdown());
                if done {
                    self.drain.phase = DrainPhase::NotifyPendingShutdownComplete;
                    if self.drain.grace_timer.is_none() {
                        self.drain.phase = DrainPhase::CloseWhenIdle;
                        self.drain.cursor = self.head;
                    }
                }
                false
            }
            DrainPhase::NotifyPendingShutdownComplete => {
                // Waiting on the grace timer; nothing to do this tick.
                false
            }
            DrainPhase::CloseWhenIdle => {
                let done = self.walk_drain_batch(|conn| conn.close_when_idle());
                if done {
                    self.drain.phase = DrainPhase::CloseWhenIdleComplete;
                }
                done
            }
            DrainPhase::CloseWhenIdleComplete => true,
        }
    }

    /// Visits up to `DRAIN_BATCH_SIZE` nodes from `self.drain.cursor`
    /// onward, invoking `deliver` on each and advancing the cursor as it
    /// goes (cursor-before-mutation discipline even though `deliver` itself
    /// doesn't erase). Returns `true` once the cursor reaches the tail.
    fn walk_drain_batch(&mut self, deliver: impl Fn(&mut C)) -> bool {
        let mut processed = 0;
        while processed < DRAIN_BATCH_SIZE {
            let Some(key) = self.drain.cursor else {
                return true;
            };
            self.drain.cursor = self.nodes[key].next;
            deliver(&mut self.nodes[key].conn);
            processed += 1;
        }
        self.drain.cursor.is_none()
    }

    /// Synchronous, full iteration: forcibly closes every connection. Must
    /// be invoked from the manager's event-loop context.
    pub fn drop_all_connections(&mut self, wheel: &mut TimerWheel) {
        let keys: Vec<ConnKey> = self.iter_keys().collect();
        for key in keys {
            self.nodes[key].conn.drop_connection(DropReason::Shutdown);
            self.remove(key, wheel);
        }
    }

    /// Forcibly drops the front `fraction` of the list (busy-first,
    /// most-recent-first).
    pub fn drop_connections(&mut self, fraction: f64, wheel: &mut TimerWheel) {
        let n = ((self.nodes.len() as f64) * fraction).ceil() as usize;
        let keys: Vec<ConnKey> = self.iter_keys().take(n).collect();
        for key in keys {
            self.nodes[key].conn.drop_connection(DropReason::Shutdown);
            self.remove(key, wheel);
        }
    }

    /// Walks the idle suffix from the idle cursor, dropping connections
    /// whose idle duration strictly exceeds the early-drop threshold, up to
    /// `n` of them. Idle durations are non-increasing from the cursor
    /// onward (newer deactivations land at the tail), so the walk stops at
    /// the first connection that doesn't qualify. Returns the number
    /// actually dropped.
    pub fn drop_idle_connections(&mut self, n: usize, wheel: &mut TimerWheel) -> usize {
        if self.early_drop_threshold >= self.idle_timeout {
            return 0;
        }
        let now = Instant::now();
        let mut to_drop = Vec::new();
        let mut cursor = self.idle_cursor;
        while to_drop.len() < n {
            let Some(key) = cursor else { break };
            let idle_for = now.saturating_duration_since(self.nodes[key].since);
            if idle_for <= self.early_drop_threshold {
                break;
            }
            to_drop.push(key);
            cursor = self.nodes[key].next;
        }
        let dropped = to_drop.len();
        for key in to_drop {
            self.nodes[key].conn.drop_connection(DropReason::EarlyIdleDrop);
            self.remove(key, wheel);
        }
        dropped
    }

    fn iter_keys(&self) -> impl Iterator<Item = ConnKey> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let key = cursor?;
            cursor = self.nodes[key].next;
            Some(key)
        })
    }

    fn push_front(&mut self, key: ConnKey) {
        self.nodes[key].prev = None;
        self.nodes[key].next = self.head;
        if let Some(head) = self.head {
            self.nodes[head].prev = Some(key);
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn push_back(&mut self, key: ConnKey) {
        self.nodes[key].next = None;
        self.nodes[key].prev = self.tail;
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(key);
        }
        self.tail = Some(key);
        if self.head.is_none() {
            self.head = Some(key);
        }
    }

    /// Removes `key` from the list structure, fixing neighbor links and the
    /// idle cursor. Does not free the slab slot.
    fn unlink(&mut self, key: ConnKey) {
        if self.idle_cursor == Some(key) {
            self.idle_cursor = self.nodes[key].next;
        }
        if self.drain.cursor == Some(key) {
            self.drain.cursor = self.nodes[key].next;
        }
        let prev = self.nodes[key].prev;
        let next = self.nodes[key].next;
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[key].prev = None;
        self.nodes[key].next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestConn {
        busy: bool,
        notified: u32,
        closed_when_idle: u32,
        dropped: Option<DropReason>,
    }

    impl Connection for TestConn {
        fn is_busy(&self) -> bool {
            self.busy
        }
        fn notify_pending_shutdown(&mut self) {
            self.notified += 1;
        }
        fn close_when_idle(&mut self) {
            self.closed_when_idle += 1;
        }
        fn drop_connection(&mut self, reason: DropReason) {
            self.dropped = Some(reason);
        }
    }

    #[test]
    fn add_then_remove_fires_empty_once() {
        let mut wheel = TimerWheel::new();
        let mut mgr: ConnectionManager<TestConn> = ConnectionManager::new(Duration::from_secs(60));
        let k = mgr.add(TestConn::default(), true, &mut wheel);
        assert_eq!(mgr.len(), 1);
        mgr.remove(k, &mut wheel);
        assert!(mgr.take_empty_notification());
        assert!(!mgr.take_empty_notification());
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn drain_all_idle_notifies_then_closes() {
        let mut wheel = TimerWheel::new();
        let mut mgr: ConnectionManager<TestConn> = ConnectionManager::new(Duration::from_secs(60));
        let keys: Vec<_> = (0..65)
            .map(|_| mgr.add(TestConn::default(), false, &mut wheel))
            .collect();
        mgr.initiate_graceful_shutdown(Duration::from_millis(0), &mut wheel);
        // idle_grace == 0 skips straight to CloseWhenIdle.
        let mut done = false;
        for _ in 0..3 {
            done = mgr.drain_tick();
            if done {
                break;
            }
        }
        assert!(done);
        for k in keys {
            assert_eq!(mgr.get(k).unwrap().closed_when_idle, 1);
        }
    }

    #[test]
    fn drain_tail_fraction_covers_expected_count() {
        let mut wheel = TimerWheel::new();
        let mut mgr: ConnectionManager<TestConn> = ConnectionManager::new(Duration::from_secs(60));
        let keys: Vec<_> = (0..65)
            .map(|_| mgr.add(TestConn::default(), false, &mut wheel))
            .collect();
        mgr.drain_connections(0.123, Duration::from_millis(0), &mut wheel);
        while !mgr.drain_tick() {}
        let touched = keys.iter().filter(|k| mgr.get(**k).unwrap().closed_when_idle == 1).count();
        assert_eq!(touched, 8);
    }

    #[test]
    fn early_drop_respects_threshold() {
        let mut wheel = TimerWheel::new();
        let mut mgr: ConnectionManager<TestConn> = ConnectionManager::new(Duration::from_millis(100));
        let long_idle = mgr.add(TestConn::default(), false, &mut wheel);
        let short_idle = mgr.add(TestConn::default(), false, &mut wheel);
        mgr.on_deactivated(long_idle);
        std::thread::sleep(Duration::from_millis(60));
        mgr.on_deactivated(short_idle);
        std::thread::sleep(Duration::from_millis(5));
        let dropped = mgr.drop_idle_connections(10, &mut wheel);
        assert_eq!(dropped, 1);
        assert!(mgr.get(long_idle).is_none());
        assert!(mgr.get(short_idle).is_some());
    }

    #[test]
    fn idle_cursor_is_none_iff_no_idle_connections() {
        let mut wheel = TimerWheel::new();
        let mut mgr: ConnectionManager<TestConn> = ConnectionManager::new(Duration::from_secs(60));
        let a = mgr.add(TestConn::default(), false, &mut wheel);
        assert!(mgr.idle_cursor.is_none());
        mgr.on_deactivated(a);
        assert_eq!(mgr.idle_cursor, Some(a));
        mgr.on_activated(a);
        assert!(mgr.idle_cursor.is_none());
    }
}
