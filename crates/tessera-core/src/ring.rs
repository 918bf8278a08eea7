//! Identifier ring.
//!
//! Nodes and objects share one circular 128-bit identifier space. All
//! arithmetic wraps modulo 2^128, so "clockwise" simply means "increasing,
//! with wrap-around".

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the 128-bit identifier ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RingId(pub u128);

/// Node identifiers live on the same ring as object identifiers.
pub type NodeId = RingId;

impl RingId {
    /// Zero point of the ring.
    pub const ZERO: RingId = RingId(0);

    /// Construct from raw bits.
    pub const fn new(bits: u128) -> Self {
        Self(bits)
    }

    /// Raw bits of this position.
    pub const fn bits(self) -> u128 {
        self.0
    }

    /// Build an identifier from the first 16 bytes of `bytes`, zero padded.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 16];
        let len = bytes.len().min(16);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(u128::from_be_bytes(buf))
    }

    /// Big-endian byte representation.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Move `offset` steps clockwise.
    pub fn add(self, offset: RingId) -> RingId {
        RingId(self.0.wrapping_add(offset.0))
    }

    /// Move `offset` steps counter-clockwise.
    pub fn sub(self, offset: RingId) -> RingId {
        RingId(self.0.wrapping_sub(offset.0))
    }

    /// Clockwise distance from `self` to `other`.
    pub fn clockwise_distance(self, other: RingId) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// Shortest distance in either direction.
    pub fn ring_distance(self, other: RingId) -> u128 {
        let cw = self.clockwise_distance(other);
        let ccw = other.clockwise_distance(self);
        cw.min(ccw)
    }

    /// Midpoint of the clockwise arc from `self` to `other`.
    pub fn clockwise_midpoint(self, other: RingId) -> RingId {
        RingId(self.0.wrapping_add(self.clockwise_distance(other) / 2))
    }
}

impl fmt::Debug for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({:032x})", self.0)
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell nodes apart in logs
        write!(f, "<{:08x}..>", (self.0 >> 96) as u32)
    }
}

impl From<u128> for RingId {
    fn from(bits: u128) -> Self {
        Self(bits)
    }
}

/// A contiguous arc of the ring.
///
/// An arc runs clockwise from `ccw` (inclusive) to `cw` (exclusive). The two
/// degenerate cases get their own variants so that "nothing" and
/// "everything" are never confused with an arc whose endpoints coincide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum IdRange {
    /// Contains no identifier.
    Empty,
    /// Contains every identifier.
    Full,
    /// Clockwise arc `[ccw, cw)`; `ccw != cw`.
    Arc {
        /// Counter-clockwise (inclusive) end.
        ccw: RingId,
        /// Clockwise (exclusive) end.
        cw: RingId,
    },
}

impl IdRange {
    /// Build an arc. Coinciding endpoints produce [`IdRange::Empty`].
    pub fn new(ccw: RingId, cw: RingId) -> Self {
        if ccw == cw {
            IdRange::Empty
        } else {
            IdRange::Arc { ccw, cw }
        }
    }

    /// Does the range contain `id`?
    pub fn contains(&self, id: RingId) -> bool {
        match *self {
            IdRange::Empty => false,
            IdRange::Full => true,
            IdRange::Arc { ccw, cw } => ccw.clockwise_distance(id) < ccw.clockwise_distance(cw),
        }
    }

    /// Whether this range holds no identifier.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdRange::Empty)
    }

    /// Number of identifiers covered, saturating at `u128::MAX` for the full ring.
    pub fn size(&self) -> u128 {
        match *self {
            IdRange::Empty => 0,
            IdRange::Full => u128::MAX,
            IdRange::Arc { ccw, cw } => ccw.clockwise_distance(cw),
        }
    }

    /// Counter-clockwise end, when one exists.
    pub fn ccw(&self) -> Option<RingId> {
        match *self {
            IdRange::Arc { ccw, .. } => Some(ccw),
            _ => None,
        }
    }

    /// Clockwise end, when one exists.
    pub fn cw(&self) -> Option<RingId> {
        match *self {
            IdRange::Arc { cw, .. } => Some(cw),
            _ => None,
        }
    }

    /// Rotate the range clockwise by `offset`.
    pub fn shift(&self, offset: RingId) -> IdRange {
        match *self {
            IdRange::Arc { ccw, cw } => IdRange::Arc {
                ccw: ccw.add(offset),
                cw: cw.add(offset),
            },
            other => other,
        }
    }

    /// Intersection of two ranges.
    ///
    /// Two arcs on a circle can overlap in two disjoint pieces. In that case
    /// only the piece starting at `other`'s counter-clockwise end is returned.
    pub fn intersect(&self, other: &IdRange) -> IdRange {
        match (*self, *other) {
            (IdRange::Empty, _) | (_, IdRange::Empty) => IdRange::Empty,
            (IdRange::Full, r) | (r, IdRange::Full) => r,
            (IdRange::Arc { ccw: a0, cw: a1 }, IdRange::Arc { ccw: b0, cw: b1 }) => {
                let start = if self.contains(b0) {
                    b0
                } else if other.contains(a0) {
                    a0
                } else {
                    return IdRange::Empty;
                };
                let end = if start.clockwise_distance(a1) <= start.clockwise_distance(b1) {
                    a1
                } else {
                    b1
                };
                IdRange::new(start, end)
            }
        }
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdRange::Empty => write!(f, "[empty]"),
            IdRange::Full => write!(f, "[full]"),
            IdRange::Arc { ccw, cw } => write!(f, "[{ccw} - {cw})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(v: u128) -> RingId {
        RingId(v)
    }

    #[test]
    fn arc_wraps_around_zero() {
        let range = IdRange::new(id(u128::MAX - 10), id(10));
        assert!(range.contains(id(u128::MAX)));
        assert!(range.contains(id(0)));
        assert!(range.contains(id(9)));
        assert!(!range.contains(id(10)));
        assert!(!range.contains(id(1_000)));
        assert_eq!(range.size(), 21);
    }

    #[test]
    fn coinciding_endpoints_are_empty() {
        assert_eq!(IdRange::new(id(5), id(5)), IdRange::Empty);
        assert!(!IdRange::Empty.contains(id(5)));
        assert!(IdRange::Full.contains(id(5)));
    }

    #[test]
    fn intersection_of_overlapping_arcs() {
        let a = IdRange::new(id(0), id(100));
        let b = IdRange::new(id(50), id(200));
        assert_eq!(a.intersect(&b), IdRange::new(id(50), id(100)));
        assert_eq!(b.intersect(&a), IdRange::new(id(50), id(100)));
    }

    #[test]
    fn intersection_of_disjoint_arcs_is_empty() {
        let a = IdRange::new(id(0), id(100));
        let b = IdRange::new(id(100), id(200));
        assert_eq!(a.intersect(&b), IdRange::Empty);
    }

    #[test]
    fn intersection_with_full_and_empty() {
        let a = IdRange::new(id(10), id(20));
        assert_eq!(a.intersect(&IdRange::Full), a);
        assert_eq!(IdRange::Full.intersect(&a), a);
        assert_eq!(a.intersect(&IdRange::Empty), IdRange::Empty);
    }

    #[test]
    fn shift_moves_both_ends() {
        let a = IdRange::new(id(10), id(20));
        assert_eq!(a.shift(id(5)), IdRange::new(id(15), id(25)));
        assert_eq!(IdRange::Full.shift(id(5)), IdRange::Full);
    }

    #[test]
    fn midpoint_wraps() {
        let mid = id(u128::MAX - 9).clockwise_midpoint(id(10));
        assert_eq!(mid, id(0));
    }

    proptest! {
        #[test]
        fn intersection_is_contained_in_both(
            a0 in any::<u128>(), a1 in any::<u128>(),
            b0 in any::<u128>(), b1 in any::<u128>(),
            probe in any::<u128>(),
        ) {
            let a = IdRange::new(id(a0), id(a1));
            let b = IdRange::new(id(b0), id(b1));
            let both = a.intersect(&b);
            if both.contains(id(probe)) {
                prop_assert!(a.contains(id(probe)));
                prop_assert!(b.contains(id(probe)));
            }
        }

        #[test]
        fn shifted_range_contains_shifted_point(
            a0 in any::<u128>(), a1 in any::<u128>(),
            offset in any::<u128>(), probe in any::<u128>(),
        ) {
            let a = IdRange::new(id(a0), id(a1));
            prop_assert_eq!(
                a.contains(id(probe)),
                a.shift(id(offset)).contains(id(probe).add(id(offset)))
            );
        }
    }
}
