use std::fmt::{Display, Formatter};

/// A 24-bit counter as used for datagram sequence numbers, message indices and order indices.
///
/// Counters wrap around at 2^24, so there is no total order on them. Two indices are compared
///  by their modular distance instead: `a` is after `b` if going forward from `b` reaches `a`
///  in less than half the index space.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Index24(u32);

impl Display for Index24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Index24 {
    pub const ZERO: Index24 = Index24(0);
    pub const MASK: u32 = 0xFF_FFFF;
    pub const HALF_RANGE: u32 = 0x80_0000;

    pub fn new(raw: u32) -> Index24 {
        Index24(raw & Self::MASK)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Index24 {
        self.plus(1)
    }

    pub fn plus(self, n: u32) -> Index24 {
        Index24(self.0.wrapping_add(n) & Self::MASK)
    }

    /// number of increments needed to get from `base` to `self`
    pub fn distance_from(self, base: Index24) -> u32 {
        self.0.wrapping_sub(base.0) & Self::MASK
    }

    pub fn is_after(self, other: Index24) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < Self::HALF_RANGE
    }

    pub fn is_before(self, other: Index24) -> bool {
        other.is_after(self)
    }

    /// returns the current value and advances the counter
    pub fn post_increment(&mut self) -> Index24 {
        let result = *self;
        *self = self.next();
        result
    }
}
