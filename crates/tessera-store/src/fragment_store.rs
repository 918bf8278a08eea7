//! Typed fragment store with a write-through metadata cache.
//!
//! Metadata for every stored fragment is mirrored in memory so that scans
//! (garbage collection, sync, local scan, handoff) never touch the backend.
//! Cache rule: every write goes to the backend first and is mirrored only
//! on success; a read that finds the backend missing a cached key evicts
//! the cache entry.

use crate::backend::StorageBackend;
use crate::error::{Result, StoreError};
use std::collections::BTreeMap;
use std::ops::Bound;
use tessera_core::{FragmentKey, FragmentMetadata, Manifest, StoredFragment, Timestamp, VersionKey};

/// Fragment store.
pub struct FragmentStore {
    backend: Box<dyn StorageBackend>,
    metadata: BTreeMap<FragmentKey, FragmentMetadata>,
}

impl std::fmt::Debug for FragmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStore")
            .field("fragments", &self.metadata.len())
            .finish()
    }
}

impl FragmentStore {
    /// Open a store, loading metadata for every key the backend holds.
    pub fn open(backend: Box<dyn StorageBackend>) -> Result<Self> {
        let mut metadata = BTreeMap::new();
        for key in backend.scan()? {
            match backend.metadata(&key)? {
                Some(meta) => {
                    metadata.insert(key, meta);
                }
                None => {
                    tracing::warn!(key = %key, "Stored fragment has no metadata; ignoring");
                }
            }
        }
        tracing::debug!(fragments = metadata.len(), "Fragment store opened");
        Ok(Self { backend, metadata })
    }

    /// Number of fragments held.
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Whether no fragments are held.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Whether `key` is held.
    pub fn contains(&self, key: &FragmentKey) -> bool {
        self.metadata.contains_key(key)
    }

    /// Cached metadata for `key`.
    pub fn metadata(&self, key: &FragmentKey) -> Option<FragmentMetadata> {
        self.metadata.get(key).copied()
    }

    /// All held keys with their metadata, in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&FragmentKey, &FragmentMetadata)> {
        self.metadata.iter()
    }

    /// Held keys strictly after `cursor`, in key order.
    pub fn entries_after(
        &self,
        cursor: Option<FragmentKey>,
    ) -> impl Iterator<Item = (&FragmentKey, &FragmentMetadata)> {
        let start = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.metadata.range((start, Bound::Unbounded))
    }

    /// Held fragment indices of one version.
    pub fn indices_of(&self, version_key: &VersionKey) -> Vec<u32> {
        let start = version_key.fragment(0);
        self.metadata
            .range(start..)
            .take_while(|(key, _)| key.version_key == *version_key)
            .map(|(key, _)| key.index)
            .collect()
    }

    /// Read a fragment with its manifest.
    pub fn get(&mut self, key: &FragmentKey) -> Result<Option<StoredFragment>> {
        if !self.metadata.contains_key(key) {
            return Ok(None);
        }
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => {
                tracing::error!(key = %key, "Cached fragment missing from backend; evicting");
                self.metadata.remove(key);
                Err(StoreError::inconsistent(format!("{key} missing from backend")))
            }
        }
    }

    /// Store a fragment, replacing any previous value.
    pub fn put(
        &mut self,
        key: FragmentKey,
        stored: &StoredFragment,
        metadata: FragmentMetadata,
    ) -> Result<()> {
        let bytes = bincode::serialize(stored)?;
        self.backend.put(key, metadata, bytes)?;
        self.metadata.insert(key, metadata);
        Ok(())
    }

    /// Store a newly accepted fragment at `now`.
    pub fn insert(&mut self, key: FragmentKey, stored: StoredFragment, now: Timestamp) -> Result<()> {
        let metadata = FragmentMetadata::new(stored.manifest.expiration, now);
        self.put(key, &stored, metadata)
    }

    /// Replace the manifest of a held fragment with a later one.
    ///
    /// Returns `false` when the fragment is absent or `manifest` does not
    /// extend the current expiration.
    pub fn replace_manifest(&mut self, key: &FragmentKey, manifest: Manifest) -> Result<bool> {
        let Some(current) = self.metadata(key) else {
            return Ok(false);
        };
        if manifest.expiration <= current.current_expiration {
            return Ok(false);
        }
        let Some(mut stored) = self.get(key)? else {
            return Ok(false);
        };
        let metadata = current.refreshed(manifest.expiration);
        stored.manifest = manifest;
        self.put(*key, &stored, metadata)?;
        Ok(true)
    }

    /// Remove a fragment, returning it.
    pub fn remove(&mut self, key: &FragmentKey) -> Result<Option<StoredFragment>> {
        let stored = match self.get(key) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Deleting unreadable fragment");
                None
            }
        };
        if self.backend.delete(key)? {
            self.metadata.remove(key);
        } else if self.metadata.remove(key).is_some() {
            tracing::warn!(key = %key, "Deleted fragment was already gone from backend");
        }
        Ok(stored)
    }

    /// Keys whose expiration is strictly before `now`, at most `limit` of them.
    pub fn expired(&self, now: Timestamp, limit: usize) -> Vec<FragmentKey> {
        self.metadata
            .iter()
            .filter(|(_, meta)| meta.is_expired(now))
            .map(|(key, _)| *key)
            .take(limit)
            .collect()
    }
}
