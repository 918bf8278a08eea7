//! Placement function.
//!
//! Maps `(object, fragment index, version)` to a ring position. The
//! fractional offset `index / N + version * (1 / 2.7182821)` is reduced
//! modulo one, scaled onto the upper 64 bits of the ring, and added to the
//! object identifier. Sibling fragments therefore sit `2^128 / N` apart,
//! and each new version rotates the whole set by an irrational step so
//! successive versions do not land on the same peers.
//!
//! The computation is pure: every node derives identical locations.

use crate::keys::{FragmentKey, VersionKey};
use crate::ring::{IdRange, RingId};

/// Per-version rotation step.
pub const VERSION_STEP: f64 = 1.0 / 2.718_282_1;

/// Placement for a fixed fragment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    num_fragments: u32,
}

impl Placement {
    /// Placement for `num_fragments` fragments per object. Zero is treated as one.
    pub fn new(num_fragments: u32) -> Self {
        Self {
            num_fragments: num_fragments.max(1),
        }
    }

    /// Fragments per object.
    pub fn num_fragments(&self) -> u32 {
        self.num_fragments
    }

    /// Ring location of fragment `index` of `(object, version)`.
    pub fn location(&self, object: RingId, index: u32, version: u64) -> RingId {
        let index_part = self.index_fraction(index % self.num_fragments);
        let version_part = version_fraction(version);
        let fraction = index_part.wrapping_add(version_part);
        object.add(RingId((fraction as u128) << 64))
    }

    /// Ring location of a fragment key.
    pub fn location_of(&self, key: &FragmentKey) -> RingId {
        self.location(key.id(), key.index, key.version())
    }

    /// Ring location of every fragment of a version, in index order.
    pub fn locations(&self, key: &VersionKey) -> Vec<RingId> {
        (0..self.num_fragments)
            .map(|index| self.location(key.id, index, key.version))
            .collect()
    }

    /// Ring offset between fragment `i` and fragment `i + offset` of the same version.
    pub fn index_offset(&self, offset: u32) -> RingId {
        RingId((self.index_fraction(offset % self.num_fragments) as u128) << 64)
    }

    /// The range that holds fragment `i + offset` whenever `range` holds fragment `i`.
    pub fn shift_range(&self, range: &IdRange, offset: u32) -> IdRange {
        range.shift(self.index_offset(offset))
    }

    fn index_fraction(&self, index: u32) -> u64 {
        (((index as u128) << 64) / self.num_fragments as u128) as u64
    }
}

/// `frac(version * VERSION_STEP)` as a 64-bit fixed-point fraction.
fn version_fraction(version: u64) -> u64 {
    let fraction = (version as f64 * VERSION_STEP).fract();
    // f64 -> u64 casts saturate, and fraction < 1.0
    (fraction * 18_446_744_073_709_551_616.0) as u64
}
