//! Manifests, fragments and per-fragment metadata.

use crate::hash::Hash32;
use crate::keys::VersionKey;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Raw erasure-coded payload bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Encoded share.
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Wrap a payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Hash of the payload.
    pub fn hash(&self) -> Hash32 {
        Hash32::of(&self.payload)
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fragment({} bytes)", self.payload.len())
    }
}

/// Signed commitment to an object version's content.
///
/// Every fragment of a version carries its own manifest. All manifests of a
/// version share the object hash and fragment hash list; only the signature
/// and (after refresh) the expiration may differ.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Hash of the whole object.
    pub object_hash: Hash32,
    /// Hash of each fragment payload, indexed by fragment number.
    pub fragment_hashes: Vec<Hash32>,
    /// Absolute expiration time.
    pub expiration: Timestamp,
    /// Signature produced by the object policy.
    pub signature: Vec<u8>,
}

impl Manifest {
    /// Does `fragment` belong at `index` under this manifest?
    pub fn validates_fragment(&self, fragment: &Fragment, index: u32) -> bool {
        match self.fragment_hashes.get(index as usize) {
            Some(expected) => *expected == fragment.hash(),
            None => false,
        }
    }

    /// Bytes covered by the signature for `key`.
    ///
    /// Binds the version key, the content commitments and the expiration so
    /// a signature cannot be replayed onto another object or lifetime.
    pub fn signing_payload(&self, key: &VersionKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + 32 * (self.fragment_hashes.len() + 1) + 8);
        out.extend_from_slice(&key.to_bytes());
        out.extend_from_slice(self.object_hash.as_bytes());
        for hash in &self.fragment_hashes {
            out.extend_from_slice(hash.as_bytes());
        }
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out
    }

    /// Same commitments with a new expiration and signature.
    pub fn with_expiration(&self, expiration: Timestamp, signature: Vec<u8>) -> Manifest {
        Manifest {
            object_hash: self.object_hash,
            fragment_hashes: self.fragment_hashes.clone(),
            expiration,
            signature,
        }
    }

    /// Whether two manifests commit to the same content.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.object_hash == other.object_hash && self.fragment_hashes == other.fragment_hashes
    }
}

/// Local bookkeeping for a stored fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    /// Expiration of the manifest currently stored.
    pub current_expiration: Timestamp,
    /// Expiration before the last refresh, `0` if never refreshed.
    pub previous_expiration: Timestamp,
    /// When the fragment was first stored here.
    pub stored_since: Timestamp,
}

impl FragmentMetadata {
    /// Metadata for a fragment stored at `now`.
    pub fn new(current_expiration: Timestamp, now: Timestamp) -> Self {
        Self {
            current_expiration,
            previous_expiration: 0,
            stored_since: now,
        }
    }

    /// Metadata after a refresh to `expiration`. Earlier expirations are ignored.
    pub fn refreshed(&self, expiration: Timestamp) -> Self {
        if expiration <= self.current_expiration {
            return *self;
        }
        Self {
            current_expiration: expiration,
            previous_expiration: self.current_expiration,
            stored_since: self.stored_since,
        }
    }

    /// Expired strictly before `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.current_expiration < now
    }
}

/// The value kept in the fragment store: payload plus its manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFragment {
    /// Payload.
    pub fragment: Fragment,
    /// Manifest the payload validated against when stored.
    pub manifest: Manifest,
}

impl StoredFragment {
    /// Pair a fragment with its manifest.
    pub fn new(fragment: Fragment, manifest: Manifest) -> Self {
        Self { fragment, manifest }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manifest_for(fragments: &[Fragment]) -> Manifest {
        Manifest {
            object_hash: Hash32::of(b"object"),
            fragment_hashes: fragments.iter().map(Fragment::hash).collect(),
            expiration: 1_000,
            signature: vec![],
        }
    }

    #[test]
    fn out_of_range_index_never_validates() {
        let fragments = vec![Fragment::new(vec![1, 2, 3])];
        let manifest = manifest_for(&fragments);
        assert!(manifest.validates_fragment(&fragments[0], 0));
        assert!(!manifest.validates_fragment(&fragments[0], 1));
    }

    #[test]
    fn refresh_keeps_previous_expiration() {
        let meta = FragmentMetadata::new(100, 10);
        let refreshed = meta.refreshed(200);
        assert_eq!(refreshed.current_expiration, 200);
        assert_eq!(refreshed.previous_expiration, 100);
        assert_eq!(refreshed.stored_since, 10);
        assert_eq!(refreshed.refreshed(150), refreshed);
    }

    #[test]
    fn expiry_is_strict() {
        let meta = FragmentMetadata::new(100, 0);
        assert!(!meta.is_expired(100));
        assert!(meta.is_expired(101));
    }

    #[test]
    fn signing_payload_binds_expiration() {
        let manifest = manifest_for(&[Fragment::new(vec![9])]);
        let key = VersionKey::new(crate::RingId(1), 0);
        let later = manifest.with_expiration(2_000, vec![]);
        assert_ne!(manifest.signing_payload(&key), later.signing_payload(&key));
        assert!(manifest.same_content(&later));
    }

    proptest! {
        #[test]
        fn manifest_validates_only_matching_index(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 2..8),
            flip in any::<usize>(),
        ) {
            let fragments: Vec<Fragment> = payloads.into_iter().map(Fragment::new).collect();
            let manifest = manifest_for(&fragments);
            for (index, fragment) in fragments.iter().enumerate() {
                prop_assert!(manifest.validates_fragment(fragment, index as u32));
                let mut corrupted = fragment.clone();
                let at = flip % corrupted.payload.len();
                corrupted.payload[at] ^= 0x01;
                prop_assert!(!manifest.validates_fragment(&corrupted, index as u32));
                let other = (index + 1) % fragments.len();
                if fragments[other] != *fragment {
                    prop_assert!(!manifest.validates_fragment(fragment, other as u32));
                }
            }
        }
    }
}
