//! # weft-runtime
//!
//! Platform-specific runtime for the weft fiber scheduler.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Guard-paged fiber stacks (mmap)
//! - Stackful fibers with cooperative yielding
//! - A multi-threaded fair-poll scheduler
//! - A timer set ordered by absolute expiry
//! - An epoll reactor fused with the scheduler (`IoManager`)

pub mod arch;
pub mod clock;
pub mod config;
pub mod fiber;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use reactor::IoManager;
pub use scheduler::{Job, Scheduler};
pub use timer::{Timer, TimerManager, NO_TIMER};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

#[cfg(not(target_os = "linux"))]
compile_error!("weft-runtime requires Linux (epoll)");
