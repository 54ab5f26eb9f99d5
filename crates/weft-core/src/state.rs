//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created (or reset), context primed but never entered
    Init = 0,

    /// Runnable, waiting in (or headed for) the run queue
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Suspended without asking to be requeued
    Hold = 3,

    /// Callback returned normally
    Term = 4,

    /// Callback panicked; the fiber will not be rescheduled
    Except = 5,
}

impl FiberState {
    /// Check if the fiber has finished running (normally or by panic)
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check if the fiber may be re-primed with a new callback
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Init | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_states() {
        assert!(FiberState::Term.is_done());
        assert!(FiberState::Except.is_done());
        assert!(!FiberState::Exec.is_done());
        assert!(!FiberState::Hold.is_done());
    }

    #[test]
    fn test_resettable_states() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Term.is_resettable());
        assert!(FiberState::Except.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
    }

    #[test]
    fn test_u8_round_trip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(s as u8), s);
        }
        // Out-of-range values decay to Init
        assert_eq!(FiberState::from(200), FiberState::Init);
    }
}
