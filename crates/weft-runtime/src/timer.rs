//! Timers ordered by absolute expiry
//!
//! An ordered set keyed by `(expiry_ms, seq)`; the per-timer sequence
//! number is the identity tie-break, so equal timestamps iterate
//! deterministically. The manager hands expired callbacks out in
//! non-decreasing expiry order; recurring timers are reinserted at
//! `now + period`.
//!
//! The clock is wall time in milliseconds. A backward jump of more than
//! one hour is treated as a clock rollover: every timer is expired at
//! once to resynchronise.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::scheduler::SchedulerHooks;

/// Sentinel returned by `next_timer` when no timer is pending
pub const NO_TIMER: u64 = u64::MAX;

const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

/// Recurring timers fire many times, so callbacks are shared `Fn`
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Millisecond clock source; injectable for tests
pub type TimerClock = Arc<dyn Fn() -> u64 + Send + Sync>;

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Mutable timer fields, guarded by the per-timer mutex
///
/// Lock order is always manager set -> timer core.
struct TimerCore {
    /// Absolute expiry (ms since epoch)
    next_ms: u64,
    /// Period for recomputing expiry on refresh/reset/recurrence
    period_ms: u64,
    recurring: bool,
    /// Cleared once a one-shot has fired or the timer is cancelled
    cb: Option<TimerCallback>,
}

struct TimerShared {
    seq: u64,
    core: Mutex<TimerCore>,
}

/// Handle to a pending timer
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
    mgr: Weak<TimerInner>,
}

impl Timer {
    /// Remove the timer; its callback never fires
    ///
    /// No-op (false) once the timer has fired or was already cancelled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut core = self.shared.core.lock();
        if core.cb.is_none() {
            return false;
        }
        core.cb = None;
        set.timers.remove(&(core.next_ms, self.shared.seq));
        true
    }

    /// Push the expiry out to `now + period`
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut core = self.shared.core.lock();
        if core.cb.is_none() {
            return false;
        }
        if set.timers.remove(&(core.next_ms, self.shared.seq)).is_none() {
            return false;
        }
        core.next_ms = (mgr.clock)() + core.period_ms;
        set.timers
            .insert((core.next_ms, self.shared.seq), self.shared.clone());
        true
    }

    /// Change the period
    ///
    /// With `from_now` the new expiry counts from the present; otherwise
    /// from the original start point. Same period without `from_now` is a
    /// no-op (false).
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write();
        let mut core = self.shared.core.lock();
        if core.cb.is_none() {
            return false;
        }
        if ms == core.period_ms && !from_now {
            return false;
        }
        if set.timers.remove(&(core.next_ms, self.shared.seq)).is_none() {
            return false;
        }
        let start = if from_now {
            (mgr.clock)()
        } else {
            core.next_ms - core.period_ms
        };
        core.period_ms = ms;
        core.next_ms = start + ms;
        set.timers
            .insert((core.next_ms, self.shared.seq), self.shared.clone());
        true
    }
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerShared>>,
    /// Last clock observation, for rollover detection
    previous_time: u64,
}

struct TimerInner {
    set: RwLock<TimerSet>,
    /// Set once the current earliest timer has been broadcast to the
    /// reactor; cleared whenever the reactor recomputes its timeout
    tickled: AtomicBool,
    clock: TimerClock,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

/// Set of pending timers keyed by absolute expiry
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        Self::with_clock(Arc::new(clock::now_ms))
    }

    /// Build with an injected clock source
    pub fn with_clock(clock: TimerClock) -> TimerManager {
        let now = clock();
        TimerManager {
            inner: Arc::new(TimerInner {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_time: now,
                }),
                tickled: AtomicBool::new(false),
                clock,
                hooks: RwLock::new(None),
            }),
        }
    }

    /// Insert a timer expiring `ms` from now
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_arc(ms, Arc::new(cb), recurring)
    }

    pub(crate) fn add_timer_arc(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let now = (self.inner.clock)();
        let shared = Arc::new(TimerShared {
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            core: Mutex::new(TimerCore {
                next_ms: now + ms,
                period_ms: ms,
                recurring,
                cb: Some(cb),
            }),
        });

        let at_front = {
            let mut set = self.inner.set.write();
            let key = (now + ms, shared.seq);
            set.timers.insert(key, shared.clone());
            let front = set.timers.keys().next() == Some(&key)
                && !self.inner.tickled.load(Ordering::Acquire);
            if front {
                self.inner.tickled.store(true, Ordering::Release);
            }
            front
        };
        if at_front {
            if let Some(h) = self.hooks() {
                h.on_timer_front();
            }
        }

        Timer {
            shared,
            mgr: Arc::downgrade(&self.inner),
        }
    }

    /// Insert a timer whose callback fires only while `cond` is alive
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest timer; 0 when already expired,
    /// `NO_TIMER` when the set is empty
    pub fn next_timer(&self) -> u64 {
        let set = self.inner.set.read();
        self.inner.tickled.store(false, Ordering::Release);
        let Some(((next, _), _)) = set.timers.first_key_value() else {
            return NO_TIMER;
        };
        let now = (self.inner.clock)();
        if now >= *next {
            0
        } else {
            next - now
        }
    }

    /// Remove and return the callbacks of every timer with expiry <= now
    ///
    /// Recurring timers are reinserted at `now + period`; one-shots have
    /// their callback cleared. A clock rollover expires the whole set.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = (self.inner.clock)();
        {
            let set = self.inner.set.read();
            if set.timers.is_empty() {
                return Vec::new();
            }
        }

        let mut set = self.inner.set.write();
        if set.timers.is_empty() {
            return Vec::new();
        }

        let rollover = {
            let prev = set.previous_time;
            set.previous_time = now;
            now < prev && now < prev.saturating_sub(ONE_HOUR_MS)
        };
        if !rollover {
            let (first, _) = set.timers.first_key_value().expect("set not empty");
            if first.0 > now {
                return Vec::new();
            }
        }

        let expired: Vec<Arc<TimerShared>> = if rollover {
            std::mem::take(&mut set.timers).into_values().collect()
        } else {
            let rest = set.timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut set.timers, rest)
                .into_values()
                .collect()
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for shared in expired {
            let mut core = shared.core.lock();
            let Some(cb) = core.cb.clone() else { continue };
            cbs.push(cb);
            if core.recurring {
                core.next_ms = now + core.period_ms;
                let key = (core.next_ms, shared.seq);
                drop(core);
                set.timers.insert(key, shared);
            } else {
                core.cb = None;
            }
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.set.read().timers.is_empty()
    }

    pub(crate) fn bind_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.inner.hooks.write() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.inner.hooks.read().as_ref().and_then(|w| w.upgrade())
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manual_clock(start: u64) -> (Arc<AtomicU64>, TimerClock) {
        let t = Arc::new(AtomicU64::new(start));
        let c = t.clone();
        (t, Arc::new(move || c.load(Ordering::SeqCst)))
    }

    #[test]
    fn test_next_timer_sentinel_and_countdown() {
        let (t, clock) = manual_clock(1_000);
        let mgr = TimerManager::with_clock(clock);
        assert_eq!(mgr.next_timer(), NO_TIMER);

        let _timer = mgr.add_timer(100, || {}, false);
        assert_eq!(mgr.next_timer(), 100);

        t.store(1_050, Ordering::SeqCst);
        assert_eq!(mgr.next_timer(), 50);

        // Expiry in the past reads as "fire immediately".
        t.store(1_200, Ordering::SeqCst);
        assert_eq!(mgr.next_timer(), 0);
    }

    #[test]
    fn test_take_expired_in_order() {
        let (t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("b", 200u64), ("a", 100), ("c", 300)] {
            let f = fired.clone();
            mgr.add_timer(ms, move || f.lock().push(label), false);
        }

        t.store(250, Ordering::SeqCst);
        let cbs = mgr.take_expired();
        assert_eq!(cbs.len(), 2);
        for cb in cbs {
            cb();
        }
        // Non-decreasing expiry order.
        assert_eq!(*fired.lock(), vec!["a", "b"]);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_equal_expiry_tie_break_is_stable() {
        let (t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let f = fired.clone();
            mgr.add_timer(100, move || f.lock().push(i), false);
        }
        t.store(100, Ordering::SeqCst);
        for cb in mgr.take_expired() {
            cb();
        }
        // Insertion (seq) order at equal timestamps.
        assert_eq!(*fired.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_recurring_reinserts() {
        let (t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = mgr.add_timer(50, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, true);

        for tick in 1..=5u64 {
            t.store(tick * 50, Ordering::SeqCst);
            for cb in mgr.take_expired() {
                cb();
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(mgr.has_timer());
        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (_t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(100, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(mgr.next_timer(), NO_TIMER);
    }

    #[test]
    fn test_fired_timer_control_is_noop() {
        let (t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(100, || {}, false);
        t.store(100, Ordering::SeqCst);
        assert_eq!(mgr.take_expired().len(), 1);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(200, true));
    }

    #[test]
    fn test_reset_same_period_is_noop() {
        let (_t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(100, || {}, false);
        assert!(!timer.reset(100, false));
        assert!(timer.reset(100, true));
        assert!(timer.reset(200, false));
    }

    #[test]
    fn test_reset_from_start_keeps_origin() {
        let (t, clock) = manual_clock(1_000);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(100, || {}, false);

        t.store(1_050, Ordering::SeqCst);
        // Origin stays at 1_000, so the new expiry is 1_300.
        assert!(timer.reset(300, false));
        assert_eq!(mgr.next_timer(), 250);
    }

    #[test]
    fn test_refresh_restarts_countdown() {
        let (t, clock) = manual_clock(1_000);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(100, || {}, false);

        t.store(1_090, Ordering::SeqCst);
        assert!(timer.refresh());
        assert_eq!(mgr.next_timer(), 100);
    }

    #[test]
    fn test_condition_timer_skips_dead_cond() {
        let (t, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let count = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(());
        let c = count.clone();
        mgr.add_condition_timer(50, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, Arc::downgrade(&cond), false);

        let dead = Arc::new(());
        let weak_dead = Arc::downgrade(&dead);
        drop(dead);
        let c = count.clone();
        mgr.add_condition_timer(50, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, weak_dead, false);

        t.store(50, Ordering::SeqCst);
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clock_rollover_expires_everything() {
        let start = 10 * ONE_HOUR_MS;
        let (t, clock) = manual_clock(start);
        let mgr = TimerManager::with_clock(clock);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            mgr.add_timer(60_000, move || {
                c.fetch_add(1, Ordering::SeqCst);
            }, false);
        }

        // One observation to record the pre-jump time.
        assert_eq!(mgr.take_expired().len(), 0);

        // Jump back by one hour and a millisecond.
        t.store(start - ONE_HOUR_MS - 1, Ordering::SeqCst);
        let cbs = mgr.take_expired();
        assert_eq!(cbs.len(), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_small_backward_jump_is_not_rollover() {
        let start = 10 * ONE_HOUR_MS;
        let (t, clock) = manual_clock(start);
        let mgr = TimerManager::with_clock(clock);
        mgr.add_timer(60_000, || {}, false);

        assert_eq!(mgr.take_expired().len(), 0);
        t.store(start - 1_000, Ordering::SeqCst);
        assert_eq!(mgr.take_expired().len(), 0);
        assert!(mgr.has_timer());
    }
}
