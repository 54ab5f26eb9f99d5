//! Stackful fibers
//!
//! A fiber wraps a user callback with a private guard-paged stack and a
//! saved register context. Exactly one fiber per OS thread is *current*
//! at any instant; the thread's main fiber (no private stack) stands in
//! for the native stack and is created lazily on first use.
//!
//! Lifecycle: INIT -> EXEC (swap_in) -> READY/HOLD (cooperative yield)
//! -> EXEC -> TERM, or EXCEPT if the callback panics. TERM/EXCEPT fibers
//! may be re-primed with `reset`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::state::FiberState;

use crate::config;
use crate::current_arch::{self as arch, SavedContext};
use crate::stack::FiberStack;
use crate::tls;

/// Next fiber id (main fibers take id 0)
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Live fiber count, main fibers included
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type FiberCb = Box<dyn FnOnce() + Send>;

/// A stackful coroutine
///
/// Task fibers own a private stack; the per-thread main fiber has none.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    ctx: UnsafeCell<SavedContext>,
    stack: Option<FiberStack>,
    cb: UnsafeCell<Option<FiberCb>>,
    /// On exit, return to the caller root fiber instead of the
    /// scheduling fiber
    exit_to_caller: bool,
}

// `ctx` and `cb` are only touched by the thread on which the fiber is
// current (or being primed before first swap-in); the state machine and
// the scheduler's EXEC-skip enforce single ownership of a running fiber.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a task fiber around `cb`
    ///
    /// `stack_size == 0` selects the configured default. With
    /// `exit_to_caller` the fiber returns to the caller root fiber when
    /// it finishes (used for the scheduling loop hosted on the caller
    /// thread); otherwise it returns to the thread's scheduling fiber.
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        exit_to_caller: bool,
    ) -> Arc<Fiber> {
        Self::new_boxed(Box::new(cb), stack_size, exit_to_caller)
    }

    pub(crate) fn new_boxed(
        cb: FiberCb,
        stack_size: usize,
        exit_to_caller: bool,
    ) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::stack_size()
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size).expect("fiber stack allocation failed");

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1,
            state: AtomicU8::new(FiberState::Init as u8),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            stack: Some(stack),
            cb: UnsafeCell::new(Some(cb)),
            exit_to_caller,
        });

        // The Arc pins the fiber's address; the context can now be primed
        // with a pointer to it.
        unsafe {
            let top = fiber.stack.as_ref().expect("task fiber stack").top();
            arch::init_context(
                fiber.ctx.get(),
                top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        tracing::debug!(id = fiber.id, "fiber created");
        fiber
    }

    /// The thread main fiber, standing in for the native stack
    fn new_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            stack: None,
            cb: UnsafeCell::new(None),
            exit_to_caller: false,
        }
    }

    /// The fiber currently occupying this thread
    ///
    /// Materializes the thread main fiber on first call.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Arc::new(Fiber::new_main());
        tls::set_main_fiber(main.clone());
        tls::set_current_fiber(main.clone());
        tracing::debug!("main fiber created");
        main
    }

    /// The current fiber, without materializing a main fiber
    pub fn try_current() -> Option<Arc<Fiber>> {
        tls::current_fiber()
    }

    /// Id of the current fiber, 0 when none (or the main fiber) runs
    pub fn current_id() -> u64 {
        tls::current_fiber().map(|f| f.id).unwrap_or(0)
    }

    /// Number of live fibers, main fibers included
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// True for the per-thread main fiber (no private stack)
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Re-prime a finished fiber with a new callback, reusing its stack
    ///
    /// Valid only in TERM, INIT, or EXCEPT; state returns to INIT.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Some(Box::new(cb)));
    }

    pub(crate) fn reset_boxed(&self, cb: Option<FiberCb>) {
        assert!(self.stack.is_some(), "reset on a main fiber");
        let s = self.state();
        assert!(s.is_resettable(), "reset in state {}", s);

        unsafe {
            *self.cb.get() = cb;
            let top = self.stack.as_ref().expect("task fiber stack").top();
            arch::init_context(
                self.ctx.get(),
                top,
                fiber_entry as usize,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Init);
    }

    /// Switch this fiber in, suspending the thread's scheduling fiber
    ///
    /// Becomes current and EXEC; control returns here when the fiber
    /// yields or finishes.
    pub fn swap_in(self: &Arc<Fiber>) {
        assert!(
            self.state() != FiberState::Exec,
            "swap_in on an executing fiber"
        );
        let from = tls::scheduling_fiber();
        self.set_state(FiberState::Exec);
        tls::set_current_fiber(self.clone());
        unsafe {
            arch::context_switch(from.ctx.get(), self.ctx.get());
        }
    }

    /// Switch back to the thread's scheduling fiber
    ///
    /// The caller is responsible for having set the state it wants to be
    /// observed in (READY, HOLD, TERM, ...).
    pub fn swap_out(&self) {
        let to = tls::scheduling_fiber();
        // Retargeting the current slot releases the handle that kept this
        // fiber alive while it ran; a fiber referenced only by "being
        // current" is destroyed once something else drops the final ref.
        tls::set_current_fiber(to.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), to.ctx.get());
        }
    }

    /// Enter this fiber from the caller thread's main fiber
    ///
    /// Counterpart of `back`; used for the root fiber hosting the
    /// scheduling loop on a participating caller thread.
    pub fn call(self: &Arc<Fiber>) {
        let main = tls::main_fiber().expect("call: thread has no main fiber");
        self.set_state(FiberState::Exec);
        tls::set_current_fiber(self.clone());
        unsafe {
            arch::context_switch(main.ctx.get(), self.ctx.get());
        }
    }

    /// Return to the caller thread's main fiber
    pub fn back(&self) {
        let main = tls::main_fiber().expect("back: thread has no main fiber");
        tls::set_current_fiber(main.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), main.ctx.get());
        }
    }

    /// Yield the current fiber, marking it READY for requeueing
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), FiberState::Exec);
        cur.set_state(FiberState::Ready);
        cur.swap_out();
    }

    /// Yield the current fiber, marking it HOLD (resumed by whoever holds
    /// a handle to it)
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), FiberState::Exec);
        cur.set_state(FiberState::Hold);
        cur.swap_out();
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let s = self.state();
        if self.stack.is_some() {
            debug_assert!(
                matches!(s, FiberState::Term | FiberState::Init),
                "task fiber {} dropped in state {}",
                self.id,
                s
            );
        } else {
            debug_assert!(unsafe { (*self.cb.get()).is_none() });
            debug_assert_eq!(
                s,
                FiberState::Exec,
                "main fiber dropped in state {}",
                s
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .finish()
    }
}

/// Entry point executed on a task fiber's own stack
///
/// Runs the callback under a catch-all, records TERM or EXCEPT, then
/// switches away for the last time. The raw pointer stays valid because
/// the thread-local current slot holds an owning handle until the final
/// switch retargets it.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let cb = unsafe { (*fiber.cb.get()).take() };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(cb) = cb {
            cb();
        }
    }));
    match outcome {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            fiber.set_state(FiberState::Except);
            tracing::error!(
                fiber_id = fiber.id,
                panic = panic_message(&payload),
                backtrace = %Backtrace::force_capture(),
                "fiber callback panicked"
            );
        }
    }

    if fiber.exit_to_caller {
        fiber.back();
    } else {
        fiber.swap_out();
    }
    unreachable!("terminated fiber {} was resumed", fiber.id);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_main_fiber_identity() {
        let main = Fiber::current();
        assert!(main.is_main());
        assert_eq!(main.state(), FiberState::Exec);
        assert!(Arc::ptr_eq(&main, &Fiber::current()));
    }

    #[test]
    fn test_run_to_completion() {
        let _ = Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, 0, false);
        assert_eq!(f.state(), FiberState::Init);

        f.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_and_resume() {
        let _ = Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_hold();
            h.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            h.fetch_add(1, Ordering::SeqCst);
        }, 0, false);

        f.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.state(), FiberState::Hold);

        f.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(f.state(), FiberState::Ready);

        f.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let _ = Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, 0, false);

        f.swap_in();
        assert_eq!(f.state(), FiberState::Term);

        let h = hits.clone();
        f.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(f.state(), FiberState::Init);

        f.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_becomes_except() {
        let _ = Fiber::current();
        let f = Fiber::new(|| panic!("boom"), 0, false);
        f.swap_in();
        assert_eq!(f.state(), FiberState::Except);
        // EXCEPT fibers may be re-primed.
        f.reset(|| {});
        f.swap_in();
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_ids_are_unique() {
        let _ = Fiber::current();
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
        a.swap_in();
        b.swap_in();
    }

    #[test]
    fn test_current_id_inside_fiber() {
        let _ = Fiber::current();
        assert_eq!(Fiber::current_id(), 0);
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let f = Fiber::new(move || {
            s.store(Fiber::current_id(), Ordering::SeqCst);
        }, 0, false);
        let expect = f.id();
        f.swap_in();
        assert_eq!(seen.load(Ordering::SeqCst), expect);
    }
}
