use std::fmt::{Display, Formatter};

/// A 32 bit sequence number with wrap-around semantics, i.e. 0 follows after FFFFFFFF.
///
/// Sequence numbers have no total order. Comparisons are only meaningful for numbers that are
///  less than 2^31 apart, which is why window sizes are limited to below that (see
///  [crate::config::GoBackNConfig]).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNum {
    fn from(value: u32) -> Self {
        SeqNum(value)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    pub fn plus(&self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(n))
    }

    /// the number of steps from `base` to `self`, going forward (modulo 2^32)
    pub fn distance_from(&self, base: SeqNum) -> u32 {
        self.0.wrapping_sub(base.0)
    }

    pub fn is_before(&self, other: SeqNum) -> bool {
        self != &other && other.distance_from(*self) < 0x8000_0000
    }

    pub fn is_before_or_eq(&self, other: SeqNum) -> bool {
        self == &other || self.is_before(other)
    }

    /// `lower <= self < upper`, with wrap-around. An empty range (`lower == upper`) contains
    ///  nothing.
    pub fn is_in_range(&self, lower: SeqNum, upper: SeqNum) -> bool {
        self.distance_from(lower) < upper.distance_from(lower)
    }
}
