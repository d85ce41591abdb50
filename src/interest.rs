//! Readiness interest a channel registers with its poller.

use std::{fmt, ops};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// The readiness classes a [`Channel`](crate::Channel) asks its poller to
/// watch.
///
/// Unlike an event set, an interest set may be empty: a channel whose
/// interest is [`Interest::NONE`] stays known to the poller but produces no
/// events.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in nothing at all.
    pub const NONE: Interest = Interest(0);

    /// Interest in readable readiness (including priority data).
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in writable readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Adds `other` to the set. Constant counterpart of `BitOr`.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Removes `other` from the set.
    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// Returns `true` if the set is empty.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the set contains readable interest.
    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// Returns `true` if the set contains writable interest.
    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(fmt, "NONE");
        }
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn set_operations() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_none());

        let read_only = both.remove(Interest::WRITABLE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        assert!(read_only.remove(Interest::READABLE).is_none());
        assert!(Interest::NONE.is_none());
    }

    #[test]
    fn debug_output() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Interest::READABLE | Interest::WRITABLE),
            "READABLE | WRITABLE"
        );
    }
}
