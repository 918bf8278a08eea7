//! Shared fixtures.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tessera_core::{EngineConfig, Object, RingId, VersionKey, SECONDS};

/// Route engine logs to the test harness. Safe to call repeatedly.
///
/// Verbosity follows `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Version 0 of object `id` with `len` deterministic pseudo-random bytes.
pub fn test_object(id: u128, len: usize) -> Object {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(id as u64).fill_bytes(&mut data);
    Object::new(VersionKey::new(RingId(id), 0), data)
}

/// Four fragments, two survivors, and every period short enough that a
/// simulated minute covers several rounds of each protocol.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        num_fragments: 4,
        num_survivors: 2,
        min_fragments_after_insert: 1.5,
        insert_timeout_ms: 2 * SECONDS,

        neighbor_delay_after_join_ms: SECONDS,
        neighbor_interval_ms: 2 * SECONDS,
        neighbor_timeout_ms: 10 * SECONDS,
        handoff_delay_after_join_ms: 5 * SECONDS,
        handoff_interval_ms: 10 * SECONDS,
        handoff_max_fragments: 10,

        sync_delay_after_join_ms: 5 * SECONDS,
        sync_interval_ms: 10 * SECONDS,
        sync_partners_per_trial: 3,
        sync_max_fragments: 50,
        sync_min_remaining_lifetime_ms: 10 * SECONDS,
        sync_min_quiet_time_ms: 5 * SECONDS,
        manifest_aggregation_factor: 4,

        fragment_request_max_attempts: 2,
        fragment_request_timeout_ms: SECONDS,
        restore_timeout_default_ms: SECONDS,
        restore_timeout_min_ms: 500,
        restore_timeout_max_ms: 4 * SECONDS,
        restore_timeout_decrement_ms: 100,
        restore_max_boosts: 2,
        overall_restore_timeout_ms: 10 * SECONDS,

        gc_interval_ms: 5 * SECONDS,
        local_scan_interval_ms: 5 * SECONDS,
        trash_retention_ms: 30 * SECONDS,

        bulk_refresh_threshold: 3,
        bulk_refresh_probe_interval_ms: 500,
        bulk_refresh_probe_max_attempts: 5,
        bulk_refresh_manifest_timeout_ms: SECONDS,
        bulk_refresh_patch_timeout_ms: SECONDS,

        token_bucket_capacity: 100,
        token_bucket_tokens_per_second: 50,
        shaper_tick_interval_ms: 500,
        shaper_jobs_per_tick: 10,
        shaper_job_timeout_ms: 20 * SECONDS,

        rng_seed: Some(7),
        ..EngineConfig::default()
    }
}
