//! # weft - stackful fiber runtime
//!
//! A user-space M:N task runtime: a fair-poll fiber scheduler fused with
//! an epoll reactor and an expiry-ordered timer set. Application code
//! expresses blocking I/O in straight-line style; the runtime multiplexes
//! thousands of fibers onto a small pool of OS threads, suspending and
//! resuming them around readiness events and timer expirations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{EventSet, Fiber, IoManager};
//!
//! fn main() {
//!     let io = IoManager::new(2, false, "app");
//!
//!     io.schedule(|| {
//!         let io = IoManager::current().unwrap();
//!         // Park this fiber until the descriptor turns readable.
//!         io.add_event(some_fd, EventSet::READ).unwrap();
//!         Fiber::yield_to_hold();
//!         // Readable now; read without blocking the worker.
//!     }, None);
//!
//!     io.add_timer(500, || println!("half a second"), false);
//!     io.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      User Code                          │
//! │      schedule(), add_event(), add_timer(), sleep_ms     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Scheduler                          │
//! │       FIFO run queue, affinity scan, worker threads     │
//! └─────────────────────────────────────────────────────────┘
//!          │                 │                  │
//!          ▼                 ▼                  ▼
//!    ┌───────────┐     ┌───────────┐     ┌────────────┐
//!    │  Worker   │     │  Worker   │     │ idle fiber │
//!    │  thread   │     │  thread   │     │ epoll_wait │
//!    └───────────┘     └───────────┘     └────────────┘
//!                                              │
//!                             ┌────────────────┼───────────┐
//!                             ▼                ▼           ▼
//!                        fd waiters      timer set     wake pipe
//! ```

// Re-export core types
pub use weft_core::{
    env_get, env_get_bool, env_get_opt, EventSet, FiberState, RtError, RtResult,
};

// Re-export runtime types
pub use weft_runtime::{
    Fiber, IoManager, Job, RuntimeConfig, Scheduler, Timer, TimerManager, NO_TIMER,
};

pub use weft_runtime::tls::thread_id;

use std::sync::Arc;

/// Yield execution to the scheduler
///
/// From inside a task fiber the fiber is marked READY and requeued; on a
/// bare thread this yields the OS thread.
pub fn yield_now() {
    if let Some(f) = Fiber::try_current() {
        if !f.is_main() {
            Fiber::yield_to_ready();
            return;
        }
    }
    std::thread::yield_now();
}

/// Put the current fiber to sleep for `ms` milliseconds
///
/// Registers a one-shot timer that requeues the fiber, then yields to
/// hold. Must run inside a task fiber of an [`IoManager`].
pub fn sleep_ms(ms: u64) {
    let io = IoManager::current().expect("sleep_ms requires an IoManager on this thread");
    let fiber = Fiber::current();
    assert!(!fiber.is_main(), "sleep_ms must run inside a task fiber");

    let target = Arc::downgrade(&io);
    io.add_timer(
        ms,
        move || {
            if let Some(io) = target.upgrade() {
                io.schedule_fiber(fiber.clone(), None);
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}
