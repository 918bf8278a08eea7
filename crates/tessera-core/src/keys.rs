//! Object and fragment keys.

use crate::ring::RingId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one version of an object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    /// Object identifier on the ring.
    pub id: RingId,
    /// Monotonic version number; older versions stay retrievable.
    pub version: u64,
}

impl VersionKey {
    /// Build a key.
    pub const fn new(id: RingId, version: u64) -> Self {
        Self { id, version }
    }

    /// Key of fragment `index` of this version.
    pub const fn fragment(self, index: u32) -> FragmentKey {
        FragmentKey {
            version_key: self,
            index,
        }
    }

    /// Canonical byte form: id (16 bytes) followed by the version (8 bytes).
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(&self.id.to_bytes());
        out[16..].copy_from_slice(&self.version.to_be_bytes());
        out
    }
}

impl fmt::Debug for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.version)
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.version)
    }
}

/// Identifies one fragment of one object version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    /// The version this fragment belongs to.
    pub version_key: VersionKey,
    /// Fragment index in `0..num_fragments`.
    pub index: u32,
}

impl FragmentKey {
    /// Build a key.
    pub const fn new(version_key: VersionKey, index: u32) -> Self {
        Self { version_key, index }
    }

    /// Object identifier.
    pub const fn id(&self) -> RingId {
        self.version_key.id
    }

    /// Object version.
    pub const fn version(&self) -> u64 {
        self.version_key.version
    }

    /// Key of a sibling fragment of the same version.
    pub const fn with_index(&self, index: u32) -> FragmentKey {
        FragmentKey {
            version_key: self.version_key,
            index,
        }
    }

    /// Canonical byte form: version key bytes followed by the index.
    pub fn to_bytes(&self) -> [u8; 28] {
        let mut out = [0u8; 28];
        out[..24].copy_from_slice(&self.version_key.to_bytes());
        out[24..].copy_from_slice(&self.index.to_be_bytes());
        out
    }
}

impl fmt::Debug for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.version_key, self.index)
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.version_key, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_keys_order_by_version_then_index() {
        let vk = VersionKey::new(RingId(7), 3);
        let mut keys = vec![vk.fragment(2), vk.fragment(0), VersionKey::new(RingId(7), 1).fragment(3)];
        keys.sort();
        assert_eq!(keys[0].version(), 1);
        assert_eq!(keys[1].index, 0);
        assert_eq!(keys[2].index, 2);
    }

    #[test]
    fn byte_form_is_distinct_per_index() {
        let vk = VersionKey::new(RingId(7), 3);
        assert_ne!(vk.fragment(0).to_bytes(), vk.fragment(1).to_bytes());
        assert_eq!(&vk.fragment(1).to_bytes()[..24], &vk.to_bytes());
    }
}
