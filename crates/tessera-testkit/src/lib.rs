//! Tessera Testing Infrastructure
//!
//! Deterministic stand-ins for every collaborator the engine consumes, so
//! protocol behaviour can be exercised in-process:
//!
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`PolyCodec`]: a systematic K-of-N erasure code over GF(257)
//! - [`ReferencePolicy`]: ed25519 manifest signing on top of the codec
//! - [`SimNetwork`]: a ring of engines with key-based routing, node loss
//!   and simulated time
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! tessera-testkit = { workspace = true }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod codec;
pub mod fixtures;
pub mod network;
pub mod policy;

pub use clock::ManualClock;
pub use codec::PolyCodec;
pub use fixtures::{init_tracing, small_config, test_object};
pub use network::{Delivery, SimNetwork, SimOverlay};
pub use policy::ReferencePolicy;
