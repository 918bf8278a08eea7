//! Bloom filter for anti-entropy digests.
//!
//! Sized from the element count `n` and false-positive budget `p`:
//! `m = ceil(-n ln p / (ln 2)^2)` bits and `k = round(m / n * ln 2)` probes.
//! Probes use double hashing over one SHA-256 digest of the element.

use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use tessera_core::{Hash32, Timestamp, VersionKey};

/// Smallest filter ever built.
const MIN_BITS: u64 = 64;

/// A Bloom filter. Never reports a false negative.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

impl BloomFilter {
    /// Filter for `expected` elements at false-positive rate `fp_rate`.
    pub fn with_rate(expected: usize, fp_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let m = (-(n * p.ln()) / (LN_2 * LN_2)).ceil() as u64;
        let num_bits = m.max(MIN_BITS);
        let num_hashes = ((num_bits as f64 / n) * LN_2).round().clamp(1.0, 32.0) as u32;
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        }
    }

    /// Bits in the filter.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Probes per element.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Add an element.
    pub fn insert(&mut self, element: &[u8]) {
        for bit in self.probes(element) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Whether `element` may have been inserted.
    pub fn contains(&self, element: &[u8]) -> bool {
        self.probes(element)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Whether the filter is structurally sound (e.g. after decoding).
    pub fn is_well_formed(&self) -> bool {
        self.num_bits > 0 && self.num_hashes > 0 && self.bits.len() as u64 * 8 >= self.num_bits
    }

    fn probes(&self, element: &[u8]) -> impl Iterator<Item = u64> {
        let digest = Hash32::of(element);
        let h1 = digest.prefix_u64();
        let h2 = digest.second_u64() | 1;
        let m = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}

/// Digest element for one version at one expiration.
pub fn sync_element(key: &VersionKey, expiration: Timestamp) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..24].copy_from_slice(&key.to_bytes());
    out[24..].copy_from_slice(&expiration.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_core::RingId;

    #[test]
    fn sizing_follows_formula() {
        let filter = BloomFilter::with_rate(1000, 0.01);
        // -1000 * ln(0.01) / ln(2)^2 = 9585.06
        assert_eq!(filter.num_bits(), 9586);
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn empty_filter_is_small_but_usable() {
        let filter = BloomFilter::with_rate(0, 0.05);
        assert_eq!(filter.num_bits(), MIN_BITS);
        assert!(!filter.contains(b"anything"));
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_rate(500, 0.05);
        for i in 0..500u64 {
            filter.insert(&sync_element(&VersionKey::new(RingId(i as u128), 0), i));
        }
        let false_positives = (10_000..20_000u64)
            .filter(|i| filter.contains(&sync_element(&VersionKey::new(RingId(*i as u128), 0), *i)))
            .count();
        // Budget is 5%; allow generous slack for a fixed sample
        assert!(false_positives < 1_000, "{false_positives} false positives");
    }

    proptest! {
        #[test]
        fn no_false_negatives(
            ids in prop::collection::vec(any::<u128>(), 1..200),
            fp_rate in 0.001f64..0.3,
        ) {
            let mut filter = BloomFilter::with_rate(ids.len(), fp_rate);
            for (i, id) in ids.iter().enumerate() {
                filter.insert(&sync_element(&VersionKey::new(RingId(*id), i as u64), 1_000));
            }
            for (i, id) in ids.iter().enumerate() {
                prop_assert!(filter.contains(&sync_element(&VersionKey::new(RingId(*id), i as u64), 1_000)));
            }
        }
    }
}
