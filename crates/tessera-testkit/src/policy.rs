//! Reference object policy: [`PolyCodec`] coding plus ed25519 manifests.

use crate::codec::PolyCodec;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{
    Fragment, Hash32, Manifest, Object, ObjectPolicy, Result, TesseraError, Timestamp, VersionKey,
};

/// Signs manifests with one key shared by every node of a test network.
///
/// With [`keep_originals`](Self::keep_originals) the policy also remembers
/// every object it created manifests for and offers them through
/// [`ObjectPolicy::local_object`].
#[derive(Debug, Clone)]
pub struct ReferencePolicy {
    signing: Arc<SigningKey>,
    codec: PolyCodec,
    originals: Option<Arc<RwLock<BTreeMap<VersionKey, Object>>>>,
}

impl ReferencePolicy {
    /// Policy with a signing key derived from `seed`.
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            signing: Arc::new(SigningKey::generate(&mut rng)),
            codec: PolyCodec,
            originals: None,
        }
    }

    /// Remember inserted objects locally.
    pub fn keep_originals(mut self) -> Self {
        self.originals = Some(Arc::default());
        self
    }

    /// Public half of the signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign `manifest` for `key`, replacing its signature.
    pub fn sign(&self, key: &VersionKey, manifest: &Manifest) -> Manifest {
        let signature = self.signing.sign(&manifest.signing_payload(key));
        manifest.with_expiration(manifest.expiration, signature.to_bytes().to_vec())
    }
}

impl ObjectPolicy for ReferencePolicy {
    fn encode(&self, object: &Object, num_fragments: u32, num_survivors: u32) -> Result<Vec<Fragment>> {
        self.codec.encode(object, num_fragments, num_survivors)
    }

    fn decode(
        &self,
        key: &VersionKey,
        fragments: &[Option<Fragment>],
        num_survivors: u32,
    ) -> Result<Object> {
        self.codec.decode(key, fragments, num_survivors)
    }

    fn create_manifests(
        &self,
        object: &Object,
        fragments: &[Fragment],
        expiration: Timestamp,
    ) -> Result<Vec<Manifest>> {
        let unsigned = Manifest {
            object_hash: Hash32::of(&object.data),
            fragment_hashes: fragments.iter().map(Fragment::hash).collect(),
            expiration,
            signature: Vec::new(),
        };
        let signed = self.sign(&object.key, &unsigned);
        if let Some(originals) = &self.originals {
            originals.write().insert(object.key, object.clone());
        }
        Ok(vec![signed; fragments.len()])
    }

    fn check_signature(&self, manifest: &Manifest, key: &VersionKey) -> bool {
        let Ok(signature) = Signature::from_slice(&manifest.signature) else {
            return false;
        };
        self.signing
            .verifying_key()
            .verify(&manifest.signing_payload(key), &signature)
            .is_ok()
    }

    fn update_manifest(
        &self,
        key: &VersionKey,
        manifest: &Manifest,
        expiration: Timestamp,
    ) -> Result<Manifest> {
        if !self.check_signature(manifest, key) {
            return Err(TesseraError::integrity(key, "manifest signature does not verify"));
        }
        let unsigned = manifest.with_expiration(expiration, Vec::new());
        Ok(self.sign(key, &unsigned))
    }

    fn local_object(&self, key: &VersionKey) -> Option<Object> {
        self.originals.as_ref()?.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tessera_core::RingId;

    fn key() -> VersionKey {
        VersionKey::new(RingId(42), 1)
    }

    #[test]
    fn manifests_verify_and_bind_the_key() {
        let policy = ReferencePolicy::new(1);
        let object = Object::new(key(), b"payload".to_vec());
        let fragments = policy.encode(&object, 4, 2).unwrap();
        let manifests = policy.create_manifests(&object, &fragments, 1_000).unwrap();
        assert_eq!(manifests.len(), 4);
        assert_eq!(manifests[0].object_hash, Hash32::of(b"payload"));
        assert!(manifests[2].validates_fragment(&fragments[2], 2));
        assert!(policy.check_signature(&manifests[0], &key()));
        assert!(!policy.check_signature(&manifests[0], &VersionKey::new(RingId(42), 2)));
    }

    #[test]
    fn update_resigns_with_new_expiration() {
        let policy = ReferencePolicy::new(1);
        let object = Object::new(key(), vec![9; 10]);
        let fragments = policy.encode(&object, 4, 2).unwrap();
        let manifest = policy.create_manifests(&object, &fragments, 1_000).unwrap().remove(0);
        let updated = policy.update_manifest(&key(), &manifest, 5_000).unwrap();
        assert_eq!(updated.expiration, 5_000);
        assert!(updated.same_content(&manifest));
        assert!(policy.check_signature(&updated, &key()));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let ours = ReferencePolicy::new(1);
        let theirs = ReferencePolicy::new(2);
        let object = Object::new(key(), vec![1, 2, 3]);
        let fragments = theirs.encode(&object, 4, 2).unwrap();
        let manifest = theirs.create_manifests(&object, &fragments, 1_000).unwrap().remove(0);
        assert!(!ours.check_signature(&manifest, &key()));
        assert_matches!(
            ours.update_manifest(&key(), &manifest, 2_000),
            Err(TesseraError::Integrity { .. })
        );
    }

    #[test]
    fn originals_are_kept_only_when_asked() {
        let object = Object::new(key(), vec![7; 3]);
        let plain = ReferencePolicy::new(3);
        let keeping = ReferencePolicy::new(3).keep_originals();
        for policy in [&plain, &keeping] {
            let fragments = policy.encode(&object, 4, 2).unwrap();
            policy.create_manifests(&object, &fragments, 10).unwrap();
        }
        assert!(plain.local_object(&key()).is_none());
        assert_eq!(keeping.local_object(&key()), Some(object));
    }
}
