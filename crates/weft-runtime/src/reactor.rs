//! Epoll reactor fused with the scheduler
//!
//! `IoManager` extends the scheduler through the hook seam: its idle
//! fiber blocks in `epoll_wait` bounded by the next timer expiry,
//! demultiplexes ready descriptors and expired timers back into the run
//! queue, and a self-pipe interrupts the wait when new work arrives.
//!
//! Events are edge-triggered and consume-once: a readiness transition
//! wakes the registered waiter exactly once, and the event is removed
//! from the interest set until the next `add_event`.

use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use weft_core::error::{RtError, RtResult};
use weft_core::event::EventSet;
use weft_core::state::FiberState;

use crate::fiber::Fiber;
use crate::scheduler::{Job, Scheduler, SchedulerHooks};
use crate::timer::{Timer, TimerManager, NO_TIMER};
use crate::tls;

const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT_MS: u64 = 3000;

/// Waiter bound to one (fd, event) slot: a fiber or a callback, plus the
/// scheduler that will receive it. Never both at once.
#[derive(Default)]
struct EventWaiter {
    scheduler: Option<Weak<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

impl EventWaiter {
    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }

    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }
}

/// Mutable half of a per-fd context, guarded by the context mutex
#[derive(Default)]
struct FdState {
    /// Union of the non-empty waiter slots
    events: EventSet,
    read: EventWaiter,
    write: EventWaiter,
}

impl FdState {
    fn waiter_mut(&mut self, event: EventSet) -> &mut EventWaiter {
        if event == EventSet::READ {
            &mut self.read
        } else if event == EventSet::WRITE {
            &mut self.write
        } else {
            unreachable!("waiter_mut: {:?}", event)
        }
    }

    /// Hand the waiter for `event` to its scheduler and clear the slot
    fn trigger(&mut self, event: EventSet) {
        assert!(self.events.contains(event));
        self.events = self.events.difference(event);

        let waiter = self.waiter_mut(event);
        let sched = waiter
            .scheduler
            .take()
            .and_then(|w| w.upgrade())
            .expect("event waiter lost its scheduler");
        if let Some(cb) = waiter.cb.take() {
            sched.schedule_job(Job::Call(cb), None);
        } else if let Some(fiber) = waiter.fiber.take() {
            sched.schedule_fiber(fiber, None);
        }
    }
}

/// Per-descriptor waiter table (one slot for READ, one for WRITE)
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

/// Scheduler + timer manager + epoll reactor
///
/// Derefs to its inner [`Scheduler`], so `schedule`, `stop`, `switch_to`
/// and friends are called directly on the manager.
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe: `[read end, write end]`
    wake_fds: [RawFd; 2],
    /// Indexed by fd; grows geometrically, slots allocated eagerly
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Number of (fd, event) slots currently armed
    pending_events: AtomicUsize,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl IoManager {
    /// Build and start an I/O scheduler
    ///
    /// Failures to create the epoll instance or the wake pipe are
    /// programming/system-setup errors and abort.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<IoManager> {
        let sched = Scheduler::new(threads, use_caller, name);

        let epfd = unsafe { libc::epoll_create1(0) };
        assert!(epfd >= 0, "epoll_create1: {}", io::Error::last_os_error());

        let mut wake_fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(wake_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe: {}", io::Error::last_os_error());

        let rt = unsafe { libc::fcntl(wake_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rt, 0, "fcntl(O_NONBLOCK): {}", io::Error::last_os_error());

        // The wake pipe's read end is always armed, edge-triggered.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: wake_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fds[0], &mut ev) };
        assert_eq!(rt, 0, "epoll_ctl(wake pipe): {}", io::Error::last_os_error());

        let io = Arc::new(IoManager {
            sched,
            timers: TimerManager::new(),
            epfd,
            wake_fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });
        grow_contexts(&mut io.fd_contexts.write(), 32);

        let hooks: Weak<dyn SchedulerHooks> = Arc::downgrade(&io) as Weak<dyn SchedulerHooks>;
        io.sched.bind_hooks(hooks.clone());
        io.timers.bind_hooks(hooks);

        io.sched.start();
        io
    }

    /// The calling thread's scheduler, if it is an `IoManager`
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current()?.hooks_arc()?.as_io_manager()
    }

    /// Number of (fd, event) slots currently armed
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    // ── Event registration ───────────────────────────────────────────

    /// Register the current fiber as the waiter for `event` on `fd`
    ///
    /// The fiber must be executing; the caller yields after registering
    /// and is rescheduled when the event fires (or is cancelled).
    pub fn add_event(&self, fd: RawFd, event: EventSet) -> RtResult<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Register a callback as the waiter for `event` on `fd`
    pub fn add_event_cb(
        &self,
        fd: RawFd,
        event: EventSet,
        cb: impl FnOnce() + Send + 'static,
    ) -> RtResult<()> {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: EventSet,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> RtResult<()> {
        assert!(event.is_single(), "add_event: exactly one of READ|WRITE");

        let ctx = self.context_for(fd);
        let mut st = ctx.state.lock();

        if st.events.contains(event) {
            tracing::error!(
                fd,
                registered = ?st.events,
                adding = ?event,
                "add_event: event already registered"
            );
            panic!("add_event: duplicate registration fd={} event={:?}", fd, event);
        }

        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if !self.epoll_arm(op, fd, st.events.union(event)) {
            return Err(RtError::os("epoll_ctl"));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        st.events = st.events.union(event);

        let waiter = st.waiter_mut(event);
        debug_assert!(waiter.is_empty());
        waiter.scheduler = Some(
            tls::scheduler_weak().unwrap_or_else(|| Arc::downgrade(&self.sched)),
        );
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    FiberState::Exec,
                    "add_event: current fiber must be executing"
                );
                waiter.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Unregister `event` from `fd` without invoking the waiter
    ///
    /// Returns false when nothing was registered.
    pub fn del_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock();
        if !st.events.contains(event) {
            return false;
        }

        let left = st.events.difference(event);
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if !self.epoll_arm(op, fd, left) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        st.events = left;
        st.waiter_mut(event).clear();
        true
    }

    /// Unregister `event` from `fd` and dispatch the waiter as if the
    /// event had fired
    pub fn cancel_event(&self, fd: RawFd, event: EventSet) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock();
        if !st.events.contains(event) {
            return false;
        }

        let left = st.events.difference(event);
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if !self.epoll_arm(op, fd, left) {
            return false;
        }

        self.trigger_event(&mut st, event);
        true
    }

    /// Drop `fd` from the interest set, dispatching every registered
    /// waiter
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock();
        if st.events.is_empty() {
            return false;
        }

        if !self.epoll_arm(libc::EPOLL_CTL_DEL, fd, EventSet::NONE) {
            return false;
        }

        if st.events.contains(EventSet::READ) {
            self.trigger_event(&mut st, EventSet::READ);
        }
        if st.events.contains(EventSet::WRITE) {
            self.trigger_event(&mut st, EventSet::WRITE);
        }
        assert!(st.events.is_empty());
        true
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Insert a timer; its callback lands in the run queue on expiry
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Insert a timer whose callback fires only while `cond` is alive
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Milliseconds until the earliest timer (`NO_TIMER` when none)
    pub fn next_timer(&self) -> u64 {
        self.timers.next_timer()
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Fetch the context for `fd`, growing the table to at least
    /// `ceil(1.5 * fd)` slots when it is out of range
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let v = self.fd_contexts.read();
            if let Some(ctx) = v.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut v = self.fd_contexts.write();
        let target = ((fd as usize) * 3 + 1) / 2;
        grow_contexts(&mut v, target.max(fd as usize + 1));
        v[fd as usize].clone()
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.fd_contexts.read().get(fd as usize).cloned()
    }

    #[cfg(test)]
    fn context_capacity(&self) -> usize {
        self.fd_contexts.read().len()
    }

    /// Program epoll for `fd` with the given residual interest set
    ///
    /// Logs and returns false on failure; callers must not mutate state
    /// in that case.
    fn epoll_arm(&self, op: libc::c_int, fd: RawFd, interest: EventSet) -> bool {
        let events = if op == libc::EPOLL_CTL_DEL {
            0
        } else {
            libc::EPOLLET as u32 | to_epoll(interest)
        };
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            tracing::error!(
                epfd = self.epfd,
                op = op_name(op),
                fd,
                events,
                err = %io::Error::last_os_error(),
                "epoll_ctl failed"
            );
            return false;
        }
        true
    }

    /// Dispatch the waiter for `event` and retire its pending slot
    fn trigger_event(&self, st: &mut MutexGuard<'_, FdState>, event: EventSet) {
        st.trigger(event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
    }

    fn stopping_with(&self, next_timeout: &mut u64) -> bool {
        *next_timeout = self.timers.next_timer();
        *next_timeout == NO_TIMER
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// Reactor body of the idle fiber
    ///
    /// Blocks in `epoll_wait` bounded by the next timer, funnels expired
    /// timers and ready events into the run queue, then yields back to
    /// the scheduling loop so the new work can run.
    fn idle_loop(&self) {
        tracing::debug!(name = %self.sched.name(), "idle");
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let mut next_timeout = 0u64;
            if self.stopping_with(&mut next_timeout) {
                tracing::info!(name = %self.sched.name(), "idle stopping exit");
                break;
            }

            let n = loop {
                let timeout = if next_timeout != NO_TIMER {
                    next_timeout.min(MAX_TIMEOUT_MS)
                } else {
                    MAX_TIMEOUT_MS
                };
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if rt < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    tracing::error!(%err, "epoll_wait failed");
                    break 0;
                }
                break rt as usize;
            };

            let expired = self.timers.take_expired();
            if !expired.is_empty() {
                self.sched.schedule_batch(
                    expired
                        .into_iter()
                        .map(|cb| Job::call(move || cb())),
                );
            }

            for i in 0..n {
                let raw_events = events[i].events;
                let data = events[i].u64;

                if data == self.wake_fds[0] as u64 {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.wake_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let fd = data as RawFd;
                let Some(ctx) = self.lookup_context(fd) else {
                    continue;
                };
                let mut st = ctx.state.lock();

                // Fold errors and hangups into readiness so waiters
                // reliably wake and observe the failure themselves.
                let mut ep = raw_events;
                if ep & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    ep |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32)
                        & to_epoll(st.events);
                }

                let real = from_epoll(ep).intersection(st.events);
                if real.is_empty() {
                    continue;
                }

                // Re-arm epoll with only the residual interest.
                let left = st.events.difference(real);
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if !self.epoll_arm(op, ctx.fd, left) {
                    continue;
                }

                if real.contains(EventSet::READ) {
                    self.trigger_event(&mut st, EventSet::READ);
                }
                if real.contains(EventSet::WRITE) {
                    self.trigger_event(&mut st, EventSet::WRITE);
                }
            }

            // Hand the CPU back to the scheduling loop; the local handle
            // is released first so the run loop's reference is the owner.
            let cur = Fiber::current();
            let raw = Arc::as_ptr(&cur);
            drop(cur);
            unsafe { (*raw).swap_out() };
        }
    }
}

impl SchedulerHooks for IoManager {
    /// Wake one blocked reactor by writing a byte into the self-pipe
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe {
            libc::write(self.wake_fds[1], b"T".as_ptr() as *const libc::c_void, 1)
        };
        assert_eq!(rt, 1, "wake pipe write failed");
    }

    fn stopping(&self) -> bool {
        let mut next_timeout = 0u64;
        self.stopping_with(&mut next_timeout)
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn on_timer_front(&self) {
        SchedulerHooks::tickle(self);
    }

    fn as_io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fds[0]);
            libc::close(self.wake_fds[1]);
        }
    }
}

fn grow_contexts(v: &mut Vec<Arc<FdContext>>, size: usize) {
    while v.len() < size {
        v.push(Arc::new(FdContext {
            fd: v.len() as RawFd,
            state: Mutex::new(FdState::default()),
        }));
    }
}

/// Explicit mapping from waiter events to epoll bits
fn to_epoll(events: EventSet) -> u32 {
    let mut out = 0;
    if events.contains(EventSet::READ) {
        out |= libc::EPOLLIN as u32;
    }
    if events.contains(EventSet::WRITE) {
        out |= libc::EPOLLOUT as u32;
    }
    out
}

/// Explicit mapping from epoll bits to waiter events
fn from_epoll(bits: u32) -> EventSet {
    let mut out = EventSet::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        out = out.union(EventSet::READ);
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        out = out.union(EventSet::WRITE);
    }
    out
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn close_pipe(fds: (RawFd, RawFd)) {
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
    }

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "timed out waiting for flag");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_mapping_is_explicit() {
        assert_eq!(to_epoll(EventSet::READ), libc::EPOLLIN as u32);
        assert_eq!(to_epoll(EventSet::WRITE), libc::EPOLLOUT as u32);
        assert_eq!(
            from_epoll(libc::EPOLLIN as u32 | libc::EPOLLOUT as u32),
            EventSet::READ | EventSet::WRITE
        );
    }

    #[test]
    fn test_pipe_echo_wakes_reader_fiber() {
        let io = IoManager::new(2, false, "io-echo");
        let (r, w) = make_pipe();

        let done = Arc::new(AtomicBool::new(false));
        let got = Arc::new(Mutex::new(Vec::new()));

        let io2 = io.clone();
        let d = done.clone();
        let g = got.clone();
        io.schedule(
            move || {
                io2.add_event(r, EventSet::READ).unwrap();
                Fiber::yield_to_hold();
                // Resumed by readiness.
                let mut buf = [0u8; 8];
                let n = unsafe {
                    libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                assert!(n > 0);
                g.lock().extend_from_slice(&buf[..n as usize]);
                d.store(true, Ordering::SeqCst);
            },
            None,
        );

        io.schedule(
            move || {
                let data = [0x41u8, 0x42, 0x43];
                let n = unsafe {
                    libc::write(w, data.as_ptr() as *const libc::c_void, data.len())
                };
                assert_eq!(n, 3);
            },
            None,
        );

        wait_for(&done);
        assert_eq!(*got.lock(), vec![0x41, 0x42, 0x43]);
        assert_eq!(io.pending_events(), 0);
        io.stop();
        close_pipe((r, w));
    }

    #[test]
    fn test_cancel_event_dispatches_waiter() {
        let io = IoManager::new(1, false, "io-cancel");
        let (r, w) = make_pipe();

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        io.add_event_cb(r, EventSet::READ, move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(io.pending_events(), 1);

        assert!(io.cancel_event(r, EventSet::READ));
        wait_for(&fired);
        assert_eq!(io.pending_events(), 0);

        // Idempotent: the slot is already clear.
        assert!(!io.cancel_event(r, EventSet::READ));
        assert!(!io.del_event(r, EventSet::READ));

        io.stop();
        close_pipe((r, w));
    }

    #[test]
    fn test_add_then_del_round_trip() {
        let io = IoManager::new(1, false, "io-del");
        let (r, w) = make_pipe();

        let before = io.pending_events();
        io.add_event_cb(r, EventSet::READ, || {
            unreachable!("deleted waiter must not run")
        })
        .unwrap();
        assert!(io.del_event(r, EventSet::READ));
        assert_eq!(io.pending_events(), before);
        assert!(!io.del_event(r, EventSet::READ));

        // A fresh registration on the same slot must succeed.
        io.add_event_cb(r, EventSet::READ, || {}).unwrap();
        assert!(io.del_event(r, EventSet::READ));

        io.stop();
        close_pipe((r, w));
    }

    #[test]
    fn test_cancel_all_dispatches_both_slots() {
        let io = IoManager::new(1, false, "io-all");
        let (r, w) = make_pipe();

        // Registering WRITE on the write end of a fresh pipe would fire
        // immediately (it is writable), so use the read end for both
        // slots; neither is ready.
        let read_fired = Arc::new(AtomicBool::new(false));
        let write_fired = Arc::new(AtomicBool::new(false));
        let rf = read_fired.clone();
        let wf = write_fired.clone();
        io.add_event_cb(r, EventSet::READ, move || {
            rf.store(true, Ordering::SeqCst);
        })
        .unwrap();
        io.add_event_cb(r, EventSet::WRITE, move || {
            wf.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(io.pending_events(), 2);

        assert!(io.cancel_all(r));
        wait_for(&read_fired);
        wait_for(&write_fired);
        assert_eq!(io.pending_events(), 0);
        assert!(!io.cancel_all(r));

        io.stop();
        close_pipe((r, w));
    }

    #[test]
    fn test_context_table_grows_geometrically() {
        let io = IoManager::new(1, false, "io-grow");
        let (r, w) = make_pipe();

        let target: RawFd = 300;
        let rt = unsafe { libc::dup2(r, target) };
        assert_eq!(rt, target);

        let before = io.context_capacity();
        assert!(before < target as usize);
        io.add_event_cb(target, EventSet::READ, || {}).unwrap();
        let after = io.context_capacity();
        assert!(after >= (target as usize * 3 + 1) / 2);

        assert!(io.del_event(target, EventSet::READ));
        io.stop();
        unsafe { libc::close(target) };
        close_pipe((r, w));
    }

    #[test]
    fn test_timer_callback_lands_in_scheduler() {
        let io = IoManager::new(1, false, "io-timer");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        io.add_timer(
            20,
            move || {
                f.store(true, Ordering::SeqCst);
            },
            false,
        );
        wait_for(&fired);
        io.stop();
    }
}
