//! Readiness event bitmap
//!
//! A per-descriptor waiter is registered for READ, WRITE, or both. The bit
//! values line up with EPOLLIN/EPOLLOUT, but the reactor maps them
//! explicitly rather than relying on the numeric identity.

use core::fmt;
use core::ops::{BitAnd, BitOr};

/// Set of readiness events for one file descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSet(u32);

impl EventSet {
    pub const NONE: EventSet = EventSet(0x0);
    pub const READ: EventSet = EventSet(0x1);
    pub const WRITE: EventSet = EventSet(0x4);

    /// Raw bit representation
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True iff every bit of `other` is set in `self`
    #[inline]
    pub const fn contains(self, other: EventSet) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    #[inline]
    pub const fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    /// Bits of `self` not present in `other`
    #[inline]
    pub const fn difference(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// True iff `self` names exactly one of READ or WRITE
    #[inline]
    pub const fn is_single(self) -> bool {
        self.0 == Self::READ.0 || self.0 == Self::WRITE.0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    #[inline]
    fn bitor(self, rhs: EventSet) -> EventSet {
        self.union(rhs)
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;
    #[inline]
    fn bitand(self, rhs: EventSet) -> EventSet {
        self.intersection(rhs)
    }
}

impl Default for EventSet {
    fn default() -> Self {
        EventSet::NONE
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in [(EventSet::READ, "READ"), (EventSet::WRITE, "WRITE")] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !(Self::READ.0 | Self::WRITE.0);
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(EventSet::NONE.bits(), 0x0);
        assert_eq!(EventSet::READ.bits(), 0x1);
        assert_eq!(EventSet::WRITE.bits(), 0x4);
    }

    #[test]
    fn test_set_algebra() {
        let both = EventSet::READ | EventSet::WRITE;
        assert!(both.contains(EventSet::READ));
        assert!(both.contains(EventSet::WRITE));
        assert_eq!(both.difference(EventSet::READ), EventSet::WRITE);
        assert_eq!(both.intersection(EventSet::READ), EventSet::READ);
        assert!(EventSet::NONE.is_empty());
        assert!(!both.is_empty());
    }

    #[test]
    fn test_is_single() {
        assert!(EventSet::READ.is_single());
        assert!(EventSet::WRITE.is_single());
        assert!(!EventSet::NONE.is_single());
        assert!(!(EventSet::READ | EventSet::WRITE).is_single());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", EventSet::NONE), "NONE");
        assert_eq!(format!("{:?}", EventSet::READ), "READ");
        assert_eq!(format!("{:?}", EventSet::READ | EventSet::WRITE), "READ|WRITE");
    }
}
