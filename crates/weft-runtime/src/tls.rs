//! Thread-local runtime state
//!
//! Each OS thread tracks: the fiber currently occupying its CPU, the
//! lazily created main fiber standing in for the native stack, the
//! scheduling fiber that `swap_in`/`swap_out` target, the scheduler the
//! thread belongs to, and a cached kernel thread id.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber currently executing on this thread (owning handle)
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main fiber (represents the native stack)
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Swap target for `swap_in`/`swap_out`; the main fiber on plain
    /// worker threads, the root fiber on a participating caller thread.
    /// Weak: the owner is the main-fiber slot or the scheduler itself.
    static SCHEDULING_FIBER: RefCell<Option<Weak<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread currently works for
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// Cached kernel tid (0 = not yet queried)
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(f: Arc<Fiber>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_main_fiber(f: Arc<Fiber>) {
    MAIN_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

/// The swap target for task fibers on this thread
///
/// Falls back to the main fiber (materializing it if need be) on threads
/// that never installed a scheduling fiber.
pub fn scheduling_fiber() -> Arc<Fiber> {
    let installed = SCHEDULING_FIBER.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()));
    if let Some(f) = installed {
        return f;
    }
    if let Some(f) = main_fiber() {
        return f;
    }
    Fiber::current()
}

#[inline]
pub(crate) fn set_scheduling_fiber(f: &Arc<Fiber>) {
    SCHEDULING_FIBER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(f)));
}

#[inline]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
}

#[inline]
pub(crate) fn scheduler_weak() -> Option<Weak<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduler(w: Weak<Scheduler>) {
    SCHEDULER.with(|c| *c.borrow_mut() = Some(w));
}

/// True iff this thread's scheduler is exactly `sched`
#[inline]
pub(crate) fn scheduler_is(sched: *const Scheduler) -> bool {
    SCHEDULER.with(|c| {
        c.borrow()
            .as_ref()
            .map(|w| std::ptr::eq(w.as_ptr(), sched))
            .unwrap_or(false)
    })
}

/// Kernel thread id of the calling thread
#[inline]
pub fn thread_id() -> u64 {
    THREAD_ID.with(|c| {
        let cached = c.get();
        if cached != 0 {
            return cached;
        }
        let id = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        c.set(id);
        id
    })
}
