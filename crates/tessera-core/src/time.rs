//! Millisecond timestamps.
//!
//! All deadlines and expirations in Tessera are absolute wall-clock
//! milliseconds supplied by a [`Clock`](crate::Clock). Deadlines are always
//! recomputed from the current clock reading, never cached.

/// Absolute time in milliseconds.
pub type Timestamp = u64;

/// One second in milliseconds.
pub const SECONDS: u64 = 1_000;

/// One minute in milliseconds.
pub const MINUTES: u64 = 60 * SECONDS;

/// [`Clock`](crate::Clock) backed by the operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl crate::Clock for SystemClock {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}
