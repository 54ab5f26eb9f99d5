//! Fiber scheduler
//!
//! A FIFO run queue of fibers and callbacks dispatched by N worker
//! threads, optionally with the constructing thread participating via a
//! root fiber. Entries may carry a thread affinity (kernel tid); the
//! dequeue scan skips entries bound to other threads and remembers to
//! wake them.
//!
//! The reactor extends the scheduler through the `SchedulerHooks` seam:
//! `tickle`, `stopping`, `idle`, and `on_timer_front` dispatch to the
//! installed hooks when present, and to the plain defaults otherwise.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use weft_core::state::FiberState;

use crate::fiber::Fiber;
use crate::reactor::IoManager;
use crate::tls;

/// A unit of schedulable work: an existing fiber, or a bare callback that
/// the dispatching worker wraps in its reusable callback fiber.
pub enum Job {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

impl Job {
    /// Wrap a callback
    pub fn call(f: impl FnOnce() + Send + 'static) -> Job {
        Job::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Job {
    fn from(f: Arc<Fiber>) -> Job {
        Job::Fiber(f)
    }
}

/// Run-queue entry: a job plus optional thread affinity (`None` = any)
struct Task {
    job: Job,
    thread: Option<u64>,
}

/// Overridable scheduler behaviors (implemented by the reactor)
pub(crate) trait SchedulerHooks: Send + Sync {
    /// Wake an idle worker
    fn tickle(&self);

    /// Whether the scheduler has fully drained and may stop
    fn stopping(&self) -> bool;

    /// Body of the idle fiber
    fn idle(&self);

    /// A timer became the new earliest expiry
    fn on_timer_front(&self) {}

    /// Downcast support for `IoManager::current`
    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }
}

/// Multi-threaded fair-poll fiber scheduler
pub struct Scheduler {
    name: String,
    self_weak: Weak<Scheduler>,
    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    /// Private worker threads (excludes a participating caller)
    thread_count: usize,
    /// Caller tid when `use_caller`, else `None`
    root_thread: Option<u64>,
    /// Hosts the scheduling loop on the caller thread when `use_caller`
    root_fiber: Option<Arc<Fiber>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// True until `start`, set again by `stop`
    stopping: AtomicBool,
    /// Set by `stop`; part of the drain predicate
    auto_stop: AtomicBool,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

impl Scheduler {
    /// Create a scheduler with `threads >= 1` workers
    ///
    /// With `use_caller` the constructing thread becomes a participant: a
    /// root fiber hosting the scheduling loop is created on it and only
    /// `threads - 1` private workers are spawned. `stop` must then be
    /// called from this same thread.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(threads >= 1);
        let name = name.into();
        let mut thread_count = threads;
        let mut root_thread = None;

        if use_caller {
            // Materialize this thread's main fiber before anything swaps.
            let _ = Fiber::current();
            thread_count -= 1;
            assert!(
                tls::scheduler().is_none(),
                "thread already participates in a scheduler"
            );
            root_thread = Some(tls::thread_id());
        }

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let root_fiber = if use_caller {
                let w = weak.clone();
                Some(Fiber::new(
                    move || {
                        if let Some(s) = w.upgrade() {
                            s.run();
                        }
                    },
                    0,
                    true,
                ))
            } else {
                None
            };
            Scheduler {
                name,
                self_weak: weak.clone(),
                queue: Mutex::new(VecDeque::new()),
                workers: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(root_thread.into_iter().collect()),
                thread_count,
                root_thread,
                root_fiber,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                hooks: RwLock::new(None),
            }
        });

        if use_caller {
            tls::set_scheduler(Arc::downgrade(&sched));
            tls::set_scheduling_fiber(
                sched.root_fiber.as_ref().expect("root fiber exists"),
            );
        }
        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler the calling thread works for
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    /// The calling thread's scheduling fiber (swap target)
    pub fn scheduling_fiber() -> Arc<Fiber> {
        tls::scheduling_fiber()
    }

    /// Spawn the worker threads; a second call while running is a no-op
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !self.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        assert!(workers.is_empty(), "scheduler already started");

        let self_arc = self.self_weak.upgrade().expect("scheduler not Arc-managed");
        for i in 0..self.thread_count {
            let this = self_arc.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || this.run())
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }
    }

    /// Orderly shutdown: wake every worker, drain residual work (on the
    /// caller's root fiber when `use_caller`), join all workers
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root) = &self.root_fiber {
            if self.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                tracing::info!(name = %self.name, "stopped");
                self.stopping.store(true, Ordering::SeqCst);
                if self.stopping_hook() {
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            assert!(
                self.is_current(),
                "stop() must run on the caller thread"
            );
        } else {
            assert!(
                !self.is_current(),
                "stop() must not run on a worker thread"
            );
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = &self.root_fiber {
            if !self.stopping_hook() {
                root.call();
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }

    /// Queue a callback; `thread` pins it to one worker's kernel tid
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static, thread: Option<u64>) {
        self.schedule_job(Job::call(cb), thread);
    }

    /// Queue an existing fiber
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<u64>) {
        self.schedule_job(Job::Fiber(fiber), thread);
    }

    pub fn schedule_job(&self, job: Job, thread: Option<u64>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(Task { job, thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a batch of jobs with any-thread affinity, waking workers at
    /// most once
    pub fn schedule_batch(&self, jobs: impl IntoIterator<Item = Job>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            for job in jobs {
                q.push_back(Task { job, thread: None });
            }
            was_empty && !q.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Reschedule the current fiber onto `thread` and yield
    ///
    /// Returns immediately when already on the target scheduler and
    /// thread.
    pub fn switch_to(&self, thread: Option<u64>) {
        assert!(
            Scheduler::current().is_some(),
            "switch_to outside a scheduler"
        );
        if self.is_current() {
            match thread {
                None => return,
                Some(t) if t == tls::thread_id() => return,
                _ => {}
            }
        }
        self.schedule_fiber(Fiber::current(), thread);
        Fiber::yield_to_hold();
    }

    /// Write scheduler state to `out`
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self)
    }

    /// Whether the scheduler has drained and every participant may exit
    ///
    /// Dispatches to the installed hooks (the reactor also requires no
    /// pending events and no timers).
    pub fn stopping(&self) -> bool {
        self.stopping_hook()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn is_current(&self) -> bool {
        tls::scheduler_is(self as *const Scheduler)
    }

    pub(crate) fn bind_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    pub(crate) fn hooks_arc(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().as_ref().and_then(|w| w.upgrade())
    }

    #[inline]
    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Drain predicate of the plain scheduler
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    fn stopping_hook(&self) -> bool {
        match self.hooks_arc() {
            Some(h) => h.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn tickle(&self) {
        match self.hooks_arc() {
            Some(h) => h.tickle(),
            None => tracing::trace!(name = %self.name, "tickle"),
        }
    }

    /// Body of the per-worker idle fiber
    fn idle_entry(&self) {
        if let Some(h) = self.hooks_arc() {
            h.idle();
            return;
        }
        tracing::debug!(name = %self.name, "idle");
        while !self.base_stopping() {
            Fiber::yield_to_hold();
        }
    }

    /// The scheduling loop, run by every worker thread and by the
    /// caller's root fiber
    fn run(self: Arc<Scheduler>) {
        tracing::debug!(name = %self.name, "run");
        tls::set_scheduler(Arc::downgrade(&self));
        let tid = tls::thread_id();

        if self.root_thread != Some(tid) {
            // Plain worker: the thread main fiber is the scheduling fiber.
            tls::set_scheduling_fiber(&Fiber::current());
            self.thread_ids.lock().push(tid);
        }

        let weak = Arc::downgrade(&self);
        let idle_fiber = Fiber::new(
            move || {
                if let Some(s) = weak.upgrade() {
                    s.idle_entry();
                }
            },
            0,
            false,
        );
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            let mut is_active = false;

            {
                let mut q = self.queue.lock();
                let mut idx = 0;
                while idx < q.len() {
                    let t = &q[idx];
                    // Skip entries pinned to another thread, but remember
                    // to wake whoever owns them.
                    if let Some(want) = t.thread {
                        if want != tid {
                            idx += 1;
                            tickle_me = true;
                            continue;
                        }
                    }
                    // Skip a fiber scheduled twice while still running.
                    if let Job::Fiber(f) = &t.job {
                        if f.state() == FiberState::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    task = q.remove(idx);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                    break;
                }
                tickle_me |= idx < q.len();
            }

            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.job) {
                Some(Job::Fiber(fiber)) if !fiber.state().is_done() => {
                    fiber.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);

                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, None),
                        s if !s.is_done() => fiber.set_state(FiberState::Hold),
                        _ => {}
                    }
                }
                Some(Job::Fiber(_)) => {
                    // Already TERM/EXCEPT; nothing to run.
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Job::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(Some(cb));
                            f
                        }
                        None => Fiber::new_boxed(cb, 0, false),
                    };

                    fiber.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);

                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, None),
                        FiberState::Term | FiberState::Except => {
                            // Park the fiber for reuse by the next callback.
                            fiber.reset_boxed(None);
                            cb_fiber = Some(fiber);
                        }
                        _ => {
                            // Yielded to hold: ownership moved to whoever
                            // registered it (event slot, timer, ...).
                            fiber.set_state(FiberState::Hold);
                        }
                    }
                }
                None => {
                    if is_active {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    if idle_fiber.state() == FiberState::Term {
                        tracing::info!(name = %self.name, "idle fiber term");
                        break;
                    }

                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);

                    if !idle_fiber.state().is_done() {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[Scheduler name={} size={} active_count={} idle_count={} stopping={} ]",
            self.name,
            self.thread_count,
            self.active_threads.load(Ordering::SeqCst),
            self.idle_threads.load(Ordering::SeqCst),
            self.stopping.load(Ordering::SeqCst),
        )?;
        write!(f, "    [threads: ")?;
        for (i, id) in self.thread_ids.lock().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        writeln!(f, "]")
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.stopping.load(Ordering::SeqCst),
            "scheduler dropped while running"
        );
    }
}
