//! # Tessera Core - Foundation Types
//!
//! Shared vocabulary for the Tessera erasure-coded fragment store:
//!
//! - **Ring model**: [`RingId`] positions on a 128-bit identifier ring and
//!   contiguous [`IdRange`] arcs
//! - **Placement**: the deterministic [`Placement`] function mapping
//!   `(object, fragment, version)` to a ring location
//! - **Data model**: [`VersionKey`], [`FragmentKey`], [`Manifest`],
//!   [`Fragment`] and the local-only [`FragmentMetadata`]
//! - **Configuration**: the immutable [`EngineConfig`]
//! - **Collaborators**: [`Clock`] and [`ObjectPolicy`], the interfaces the
//!   engine consumes from the outside world
//!
//! ## What's NOT in this crate
//!
//! - Storage (see `tessera-store`)
//! - Protocol state machines and wire messages (see `tessera-engine`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod effects;
pub mod error;
pub mod hash;
pub mod keys;
pub mod manifest;
pub mod placement;
pub mod ring;
pub mod time;

pub use config::EngineConfig;
pub use effects::{Clock, Object, ObjectPolicy};
pub use error::{ErrorCategory, Result, TesseraError};
pub use hash::Hash32;
pub use keys::{FragmentKey, VersionKey};
pub use manifest::{Fragment, FragmentMetadata, Manifest, StoredFragment};
pub use placement::Placement;
pub use ring::{IdRange, NodeId, RingId};
pub use time::{SystemClock, Timestamp, MINUTES, SECONDS};
