//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_core::{FragmentKey, FragmentMetadata};

type Entries = BTreeMap<FragmentKey, (FragmentMetadata, Vec<u8>)>;

/// Memory backend. Clones share the same entries, so a test can keep a
/// handle and inspect what the engine stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<Entries>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Make every subsequent operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::backend("injected failure"))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn scan(&self) -> Result<Vec<FragmentKey>> {
        self.check()?;
        Ok(self.entries.read().keys().copied().collect())
    }

    fn exists(&self, key: &FragmentKey) -> Result<bool> {
        self.check()?;
        Ok(self.entries.read().contains_key(key))
    }

    fn get(&self, key: &FragmentKey) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.entries.read().get(key).map(|(_, value)| value.clone()))
    }

    fn metadata(&self, key: &FragmentKey) -> Result<Option<FragmentMetadata>> {
        self.check()?;
        Ok(self.entries.read().get(key).map(|(metadata, _)| *metadata))
    }

    fn put(&mut self, key: FragmentKey, metadata: FragmentMetadata, value: Vec<u8>) -> Result<()> {
        self.check()?;
        self.entries.write().insert(key, (metadata, value));
        Ok(())
    }

    fn delete(&mut self, key: &FragmentKey) -> Result<bool> {
        self.check()?;
        Ok(self.entries.write().remove(key).is_some())
    }
}
