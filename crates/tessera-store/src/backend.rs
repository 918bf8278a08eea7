//! Persistent byte-store collaborator.

use crate::error::Result;
use tessera_core::{FragmentKey, FragmentMetadata};

/// Key/value persistence for fragments.
///
/// Values are opaque bytes. Metadata is stored alongside each value so the
/// fragment store can rebuild its cache without decoding payloads.
pub trait StorageBackend: Send {
    /// Every stored key.
    fn scan(&self) -> Result<Vec<FragmentKey>>;

    /// Whether `key` is stored.
    fn exists(&self, key: &FragmentKey) -> Result<bool>;

    /// The value stored under `key`.
    fn get(&self, key: &FragmentKey) -> Result<Option<Vec<u8>>>;

    /// The metadata stored under `key`.
    fn metadata(&self, key: &FragmentKey) -> Result<Option<FragmentMetadata>>;

    /// Store or replace `key`.
    fn put(&mut self, key: FragmentKey, metadata: FragmentMetadata, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Returns whether it existed.
    fn delete(&mut self, key: &FragmentKey) -> Result<bool>;
}
