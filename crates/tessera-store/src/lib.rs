//! # Tessera Store
//!
//! Local persistence for fragments:
//!
//! - [`StorageBackend`]: the byte-level key/value collaborator
//! - [`MemoryStorage`]: an in-process backend, shareable between handles
//! - [`FragmentStore`]: typed access with a write-through metadata cache
//! - [`TrashStore`]: recently deleted fragments kept for local recovery
//!
//! The fragment store exclusively owns fragment bytes and metadata. The
//! engine reaches them only through [`FragmentStore`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod fragment_store;
pub mod memory;
pub mod trash;

pub use backend::StorageBackend;
pub use error::{Result, StoreError};
pub use fragment_store::FragmentStore;
pub use memory::MemoryStorage;
pub use trash::TrashStore;
