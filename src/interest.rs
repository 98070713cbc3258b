use std::fmt;
use std::ops;

/// Set of readiness conditions over {Readable, Writable, ErrorReady, HungUp}.
///
/// Used both for what a caller registers interest in and for what a backend reports.
/// Bit values are stable; per-bit-set handlers are ordered by them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0x1);
    pub const WRITABLE: Interest = Interest(0x2);
    pub const ERROR: Interest = Interest(0x4);
    pub const HANGUP: Interest = Interest(0x8);
    pub const ALL: Interest = Interest(0xf);

    /// Unknown bits are dropped.
    #[inline]
    pub const fn from_bits(bits: u8) -> Interest {
        Interest(bits & Self::ALL.0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    #[inline]
    pub const fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interest, &str); 4] = [
            (Interest::READABLE, "Readable"),
            (Interest::WRITABLE, "Writable"),
            (Interest::ERROR, "Error"),
            (Interest::HANGUP, "Hangup"),
        ];

        if self.is_empty() {
            return write!(f, "Interest(None)");
        }
        write!(f, "Interest(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::BitAndAssign for Interest {
    #[inline]
    fn bitand_assign(&mut self, other: Interest) {
        self.0 &= other.0;
    }
}

impl ops::BitXor for Interest {
    type Output = Interest;

    #[inline]
    fn bitxor(self, other: Interest) -> Interest {
        Interest(self.0 ^ other.0)
    }
}

impl ops::Sub for Interest {
    type Output = Interest;

    #[inline]
    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl ops::Not for Interest {
    type Output = Interest;

    #[inline]
    fn not(self) -> Interest {
        Interest(!self.0 & Interest::ALL.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_union_of_four() {
        let all = Interest::READABLE | Interest::WRITABLE | Interest::ERROR | Interest::HANGUP;
        assert_eq!(all, Interest::ALL);
        assert_eq!(!Interest::NONE, Interest::ALL);
        assert_eq!(!Interest::ALL, Interest::NONE);
    }

    #[test]
    fn set_algebra() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.contains(Interest::READABLE));
        assert!(!rw.contains(Interest::READABLE | Interest::ERROR));
        assert!(rw.intersects(Interest::READABLE | Interest::ERROR));
        assert_eq!(rw & Interest::WRITABLE, Interest::WRITABLE);
        assert_eq!(rw - Interest::READABLE, Interest::WRITABLE);
        assert_eq!(rw ^ Interest::ALL, Interest::ERROR | Interest::HANGUP);

        let mut set = Interest::NONE;
        set.insert(Interest::HANGUP);
        set |= Interest::ERROR;
        set.remove(Interest::HANGUP);
        assert_eq!(set, Interest::ERROR);
    }

    #[test]
    fn from_bits_masks_unknown() {
        assert_eq!(Interest::from_bits(0xff), Interest::ALL);
        assert_eq!(Interest::from_bits(0x10), Interest::NONE);
    }

    #[test]
    fn ordering_follows_bit_pattern() {
        let mut sets = vec![Interest::HANGUP, Interest::READABLE | Interest::ERROR, Interest::READABLE];
        sets.sort();
        assert_eq!(
            sets,
            vec![Interest::READABLE, Interest::READABLE | Interest::ERROR, Interest::HANGUP]
        );
    }

    #[test]
    fn debug_names_flags() {
        assert_eq!(format!("{:?}", Interest::NONE), "Interest(None)");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::HANGUP),
            "Interest(Readable | Hangup)"
        );
    }
}
