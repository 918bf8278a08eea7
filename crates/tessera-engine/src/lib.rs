//! # Tessera Engine
//!
//! The fragment lifecycle and repair engine. A single [`Engine`] owns the
//! fragment store, the responsible range, the traffic shaper and a registry
//! of in-flight operations. It advances only when a message is
//! [delivered](Engine::deliver) or the timer [ticks](Engine::tick); no call
//! ever blocks.
//!
//! ## Protocols
//!
//! - **Insert / refresh**: quorum-based distribution of fragments or
//!   manifest updates, plus a three-stage bulk refresh
//! - **Retrieve**: adaptive whole-object restore and single-fragment repair
//! - **Maintenance**: neighbor tracking, handoff, garbage collection, local
//!   scan and Bloom-filter anti-entropy
//! - **Traffic shaping**: token bucket and deduplicated repair job queue
//!
//! [`runtime`] wraps an engine in a tokio task for use from async code.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bloom;
pub mod engine;
pub mod error;
pub mod message;
pub mod neighbors;
pub mod overlay;
pub mod runtime;
pub mod shaper;
pub mod stats;
pub mod wire;

pub use engine::{Engine, MaintenanceTask, OpId, Pending, RefreshOutcome};
pub use error::{EngineFault, WireError};
pub use message::{Body, Envelope, MessageTag};
pub use overlay::{Destination, Overlay};
pub use stats::EngineStatistics;
