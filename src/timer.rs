//! Cyclic and one-shot timer storage.
//!
//! Entries are ordered by next-fire time in the loop's monotonic domain with
//! an insertion sequence as tie-breaker, so simultaneously-due timers fire in
//! FIFO order. A separate id index gives O(log n) modify/remove. Exactly one
//! entry is detached from the store while its callback runs; removal or
//! modification of that entry from inside the callback is recorded and
//! applied when the callback returns.

use std::collections::BTreeMap;
use std::time::Duration;

use ahash::AHashMap;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Callback invoked when a timer fires. May freely mutate the loop.
pub type TimerCallback = Box<dyn FnMut(&mut EventLoop)>;

/// Stable identifier of a timer, unique for the loop's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Reschedule rule for a cyclic timer that fired late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerPolicy {
    /// Next fire is `fire_time + interval`: missed slots are skipped and the
    /// rhythm follows real elapsed time.
    #[default]
    CurrentTime,
    /// Next fire is `scheduled_time + interval`: after lag the timer fires
    /// back-to-back until every scheduled slot has been visited once.
    OnceInCurrent,
}

enum TimerKind {
    Cyclic {
        interval: Duration,
        policy: TimerPolicy,
    },
    OneShot,
}

pub(crate) struct TimerEntry {
    id: u64,
    next_fire: Duration,
    kind: TimerKind,
    pub(crate) callback: TimerCallback,
}

impl TimerEntry {
    #[cfg(test)]
    fn id(&self) -> TimerId {
        TimerId(self.id)
    }
}

/// Pending re-parameterization of the entry that is currently firing.
struct PendingModify {
    interval: Duration,
    base: Option<Duration>,
    policy: TimerPolicy,
}

pub(crate) struct TimerQueue {
    queue: BTreeMap<(Duration, u64), TimerEntry>,
    index: AHashMap<u64, (Duration, u64)>,
    next_id: u64,
    next_seq: u64,
    firing: Option<u64>,
    cancel_firing: bool,
    modify_firing: Option<PendingModify>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            queue: BTreeMap::new(),
            index: AHashMap::new(),
            next_id: 1,
            next_seq: 0,
            firing: None,
            cancel_firing: false,
            modify_firing: None,
        }
    }

    pub(crate) fn add_cyclic(
        &mut self,
        callback: TimerCallback,
        interval: Duration,
        base: Option<Duration>,
        policy: TimerPolicy,
        now: Duration,
    ) -> Result<TimerId, Error> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument("cyclic interval must be positive"));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.insert(TimerEntry {
            id,
            next_fire: first_fire(base, interval, now),
            kind: TimerKind::Cyclic { interval, policy },
            callback,
        });
        Ok(TimerId(id))
    }

    pub(crate) fn add_timed(&mut self, callback: TimerCallback, when: Duration) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.insert(TimerEntry {
            id,
            next_fire: when,
            kind: TimerKind::OneShot,
            callback,
        });
        TimerId(id)
    }

    /// Re-parameterize a cyclic entry as if it were newly added.
    pub(crate) fn modify(
        &mut self,
        id: TimerId,
        interval: Duration,
        base: Option<Duration>,
        policy: TimerPolicy,
        now: Duration,
    ) -> Result<(), Error> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument("cyclic interval must be positive"));
        }
        if self.firing == Some(id.0) {
            self.modify_firing = Some(PendingModify {
                interval,
                base,
                policy,
            });
            return Ok(());
        }
        let key = self.index.remove(&id.0).ok_or(Error::NotFound)?;
        let mut entry = self.queue.remove(&key).expect("index points into queue");
        match entry.kind {
            TimerKind::Cyclic { .. } => {
                entry.kind = TimerKind::Cyclic { interval, policy };
                entry.next_fire = first_fire(base, interval, now);
                self.insert(entry);
                Ok(())
            }
            TimerKind::OneShot => {
                self.insert(entry);
                Err(Error::NotFound)
            }
        }
    }

    /// Idempotent removal: unknown ids are a no-op.
    pub(crate) fn remove(&mut self, id: TimerId) {
        if self.firing == Some(id.0) {
            self.cancel_firing = true;
            return;
        }
        if let Some(key) = self.index.remove(&id.0) {
            self.queue.remove(&key);
        }
    }

    /// Earliest next-fire time, or `None` when the store is empty.
    pub(crate) fn next_time(&self) -> Option<Duration> {
        self.queue.first_key_value().map(|((fire, _), _)| *fire)
    }

    /// Detach the earliest entry due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<TimerEntry> {
        let (fire, _) = *self.queue.first_key_value()?.0;
        if fire > now {
            return None;
        }
        let (_, entry) = self.queue.pop_first().expect("checked non-empty");
        self.index.remove(&entry.id);
        self.firing = Some(entry.id);
        self.cancel_firing = false;
        self.modify_firing = None;
        Some(entry)
    }

    /// Return a detached entry after its callback ran. One-shot entries and
    /// entries cancelled from inside the callback are dropped; cyclic entries
    /// are re-armed per their policy (or per a pending modification).
    pub(crate) fn reinsert_after_fire(&mut self, mut entry: TimerEntry, fire_time: Duration) {
        self.firing = None;
        if std::mem::take(&mut self.cancel_firing) {
            return;
        }
        if let Some(change) = self.modify_firing.take() {
            entry.kind = TimerKind::Cyclic {
                interval: change.interval,
                policy: change.policy,
            };
            entry.next_fire = first_fire(change.base, change.interval, fire_time);
            self.insert(entry);
            return;
        }
        match entry.kind {
            TimerKind::OneShot => {}
            TimerKind::Cyclic { interval, policy } => {
                entry.next_fire = match policy {
                    TimerPolicy::OnceInCurrent => entry.next_fire + interval,
                    TimerPolicy::CurrentTime => fire_time + interval,
                };
                self.insert(entry);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
        self.firing = None;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }

    fn insert(&mut self, entry: TimerEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(entry.id, (entry.next_fire, seq));
        self.queue.insert((entry.next_fire, seq), entry);
    }
}

/// First fire time: the smallest `base + k * interval >= now` (k >= 0), or
/// `now + interval` when no base anchor is given.
fn first_fire(base: Option<Duration>, interval: Duration, now: Duration) -> Duration {
    let Some(base) = base else {
        return now + interval;
    };
    if base >= now {
        return base;
    }
    let diff = (now - base).as_nanos();
    let step = interval.as_nanos();
    let k = diff.div_ceil(step);
    Duration::from_nanos((base.as_nanos() + k * step) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut q = TimerQueue::new();
        let r = q.add_cyclic(noop(), Duration::ZERO, None, TimerPolicy::CurrentTime, ms(0));
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn phase_alignment_against_base() {
        let mut q = TimerQueue::new();
        // base 0, interval 50, added at t=120: first fire at 150.
        q.add_cyclic(noop(), ms(50), Some(ms(0)), TimerPolicy::OnceInCurrent, ms(120))
            .unwrap();
        assert_eq!(q.next_time(), Some(ms(150)));
    }

    #[test]
    fn base_on_the_grid_fires_immediately() {
        let mut q = TimerQueue::new();
        q.add_cyclic(noop(), ms(50), Some(ms(0)), TimerPolicy::CurrentTime, ms(100))
            .unwrap();
        assert_eq!(q.next_time(), Some(ms(100)));
    }

    #[test]
    fn without_base_first_fire_is_one_interval_out() {
        let mut q = TimerQueue::new();
        q.add_cyclic(noop(), ms(50), None, TimerPolicy::CurrentTime, ms(120))
            .unwrap();
        assert_eq!(q.next_time(), Some(ms(170)));
    }

    #[test]
    fn simultaneous_timers_pop_in_insertion_order() {
        let mut q = TimerQueue::new();
        let a = q.add_timed(noop(), ms(10));
        let b = q.add_timed(noop(), ms(10));
        let first = q.pop_due(ms(10)).unwrap();
        assert_eq!(first.id(), a);
        q.reinsert_after_fire(first, ms(10));
        let second = q.pop_due(ms(10)).unwrap();
        assert_eq!(second.id(), b);
        q.reinsert_after_fire(second, ms(10));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn once_in_current_preserves_scheduled_slots() {
        let mut q = TimerQueue::new();
        q.add_cyclic(noop(), ms(50), Some(ms(0)), TimerPolicy::OnceInCurrent, ms(120))
            .unwrap();
        // Lag: nothing processed until t=350. Slots 150..350 are visited once
        // each, in order.
        let mut fired = Vec::new();
        while let Some(entry) = q.pop_due(ms(350)) {
            fired.push(entry.next_fire);
            q.reinsert_after_fire(entry, ms(350));
        }
        assert_eq!(fired, vec![ms(150), ms(200), ms(250), ms(300), ms(350)]);
        assert_eq!(q.next_time(), Some(ms(400)));
    }

    #[test]
    fn current_time_skips_missed_slots() {
        let mut q = TimerQueue::new();
        q.add_cyclic(noop(), ms(50), Some(ms(0)), TimerPolicy::CurrentTime, ms(120))
            .unwrap();
        let entry = q.pop_due(ms(350)).unwrap();
        q.reinsert_after_fire(entry, ms(350));
        assert_eq!(q.next_time(), Some(ms(400)));
        assert!(q.pop_due(ms(350)).is_none());
    }

    #[test]
    fn one_shot_is_dropped_after_firing() {
        let mut q = TimerQueue::new();
        q.add_timed(noop(), ms(5));
        let entry = q.pop_due(ms(5)).unwrap();
        q.reinsert_after_fire(entry, ms(5));
        assert_eq!(q.next_time(), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut q = TimerQueue::new();
        let id = q.add_timed(noop(), ms(5));
        q.remove(id);
        q.remove(id);
        q.remove(TimerId(999));
        assert_eq!(q.next_time(), None);
    }

    #[test]
    fn remove_while_firing_cancels_rearm() {
        let mut q = TimerQueue::new();
        let id = q
            .add_cyclic(noop(), ms(50), None, TimerPolicy::CurrentTime, ms(0))
            .unwrap();
        let entry = q.pop_due(ms(50)).unwrap();
        q.remove(id);
        q.reinsert_after_fire(entry, ms(50));
        assert_eq!(q.next_time(), None);
    }

    #[test]
    fn modify_recomputes_as_newly_added() {
        let mut q = TimerQueue::new();
        let id = q
            .add_cyclic(noop(), ms(50), Some(ms(0)), TimerPolicy::CurrentTime, ms(0))
            .unwrap();
        q.modify(id, ms(100), Some(ms(0)), TimerPolicy::CurrentTime, ms(30))
            .unwrap();
        assert_eq!(q.next_time(), Some(ms(100)));
    }

    #[test]
    fn modify_unknown_id_fails() {
        let mut q = TimerQueue::new();
        let r = q.modify(TimerId(7), ms(10), None, TimerPolicy::CurrentTime, ms(0));
        assert_eq!(r, Err(Error::NotFound));
    }
}
