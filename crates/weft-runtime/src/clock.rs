//! Wall-clock time in milliseconds
//!
//! The timer set is keyed by absolute wall-clock expiry; rollover
//! detection in the timer manager exists precisely because this clock can
//! jump backwards (VM pause/resume, manual adjustment).

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rt = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    debug_assert_eq!(rt, 0);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_plausible() {
        // Some time after 2020-01-01.
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_now_ms_non_decreasing_locally() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
