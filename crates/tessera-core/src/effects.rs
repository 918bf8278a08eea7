//! Collaborator interfaces.
//!
//! The engine never reads the system clock, encodes payloads or checks
//! signatures itself. These traits are the seams where those concerns are
//! plugged in; `tessera-testkit` provides deterministic implementations.
//! The overlay (message routing and leaf set) is defined next to the wire
//! types in `tessera-engine`.

use crate::error::Result;
use crate::keys::VersionKey;
use crate::manifest::{Fragment, Manifest};
use crate::time::Timestamp;
use std::fmt;

/// Source of wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// An object version as seen by callers.
#[derive(Clone, PartialEq, Eq)]
pub struct Object {
    /// Identity of the version.
    pub key: VersionKey,
    /// Object content.
    pub data: Vec<u8>,
}

impl Object {
    /// Build an object.
    pub fn new(key: VersionKey, data: Vec<u8>) -> Self {
        Self { key, data }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("key", &self.key)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Erasure coding and manifest signing policy.
pub trait ObjectPolicy: Send + Sync {
    /// Split an object into exactly `num_fragments` fragments.
    fn encode(&self, object: &Object, num_fragments: u32, num_survivors: u32)
        -> Result<Vec<Fragment>>;

    /// Reconstruct an object from any `num_survivors` of its fragments.
    ///
    /// `fragments[i]` is fragment `i` if present.
    fn decode(
        &self,
        key: &VersionKey,
        fragments: &[Option<Fragment>],
        num_survivors: u32,
    ) -> Result<Object>;

    /// One signed manifest per fragment, all committing to the same content.
    ///
    /// `object_hash` must be [`Hash32::of`](crate::Hash32::of) the object data; restores check
    /// the decoded object against it.
    fn create_manifests(
        &self,
        object: &Object,
        fragments: &[Fragment],
        expiration: Timestamp,
    ) -> Result<Vec<Manifest>>;

    /// Verify a manifest's signature for `key`.
    fn check_signature(&self, manifest: &Manifest, key: &VersionKey) -> bool;

    /// Re-sign `manifest` with a new expiration.
    fn update_manifest(
        &self,
        key: &VersionKey,
        manifest: &Manifest,
        expiration: Timestamp,
    ) -> Result<Manifest>;

    /// A locally cached original of `key`, used to regenerate fragments on demand.
    fn local_object(&self, _key: &VersionKey) -> Option<Object> {
        None
    }
}
