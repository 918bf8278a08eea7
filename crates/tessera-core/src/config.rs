//! Engine configuration.
//!
//! All tunables live in one immutable [`EngineConfig`] handed to the engine
//! at construction. Durations are milliseconds. Partial TOML documents are
//! accepted; missing fields take the production defaults.

use crate::error::{Result, TesseraError};
use crate::time::{MINUTES, SECONDS};
use serde::{Deserialize, Serialize};

/// Tunables for a Tessera engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ========================================================================
    // Coding
    // ========================================================================
    /// Fragments per object (N).
    pub num_fragments: u32,
    /// Fragments needed to reconstruct (K).
    pub num_survivors: u32,
    /// Receipt quorum as a multiple of `num_survivors`.
    pub min_fragments_after_insert: f64,
    /// Insert and simple refresh timeout.
    pub insert_timeout_ms: u64,

    // ========================================================================
    // Neighbors and handoff
    // ========================================================================
    /// First neighbor round after start.
    pub neighbor_delay_after_join_ms: u64,
    /// Neighbor round period.
    pub neighbor_interval_ms: u64,
    /// Neighbors unseen for this long are dropped.
    pub neighbor_timeout_ms: u64,
    /// First handoff round after start.
    pub handoff_delay_after_join_ms: u64,
    /// Handoff round period.
    pub handoff_interval_ms: u64,
    /// Fragments pushed per handoff round.
    pub handoff_max_fragments: usize,

    // ========================================================================
    // Anti-entropy
    // ========================================================================
    /// First sync round after start.
    pub sync_delay_after_join_ms: u64,
    /// Sync round period.
    pub sync_interval_ms: u64,
    /// Peers asked per sync round.
    pub sync_partners_per_trial: usize,
    /// Fragments announced per sync round.
    pub sync_max_fragments: usize,
    /// Fragments closer than this to expiry are not announced.
    pub sync_min_remaining_lifetime_ms: u64,
    /// Fragments stored more recently than this are not announced.
    pub sync_min_quiet_time_ms: u64,
    /// Bloom filter false-positive budget.
    pub sync_bloom_false_positive_rate: f64,
    /// Manifests per sync data message.
    pub manifest_aggregation_factor: usize,

    // ========================================================================
    // Retrieval
    // ========================================================================
    /// Attempts to fetch a fragment from its primary holder.
    pub fragment_request_max_attempts: u32,
    /// Wait per primary fetch attempt.
    pub fragment_request_timeout_ms: u64,
    /// Initial per-round restore timeout.
    pub restore_timeout_default_ms: u64,
    /// Restore timeout floor.
    pub restore_timeout_min_ms: u64,
    /// Restore timeout ceiling.
    pub restore_timeout_max_ms: u64,
    /// Restore timeout shrink per received fragment.
    pub restore_timeout_decrement_ms: u64,
    /// Extra request rounds after the first.
    pub restore_max_boosts: u32,
    /// Maximum first-round fan-out as a multiple of `num_survivors`.
    pub restore_max_request_factor: f64,
    /// Hard limit on one object restore.
    pub overall_restore_timeout_ms: u64,

    // ========================================================================
    // Housekeeping
    // ========================================================================
    /// Garbage collection period.
    pub gc_interval_ms: u64,
    /// Deletions per garbage collection run.
    pub gc_max_fragments_per_run: usize,
    /// Local scan period.
    pub local_scan_interval_ms: u64,
    /// Fragments examined per local scan run.
    pub local_scan_max_fragments_per_run: usize,
    /// How long handed-off fragments stay in the trash.
    pub trash_retention_ms: u64,
    /// Fragments kept in the trash.
    pub trash_capacity: usize,

    // ========================================================================
    // Bulk refresh
    // ========================================================================
    /// Refreshes of at least this many objects use the bulk protocol.
    pub bulk_refresh_threshold: usize,
    /// Probe round period.
    pub bulk_refresh_probe_interval_ms: u64,
    /// Probes sent per round.
    pub bulk_refresh_probes_per_tick: usize,
    /// Probe rounds before moving on.
    pub bulk_refresh_probe_max_attempts: u32,
    /// Manifest fetch round timeout.
    pub bulk_refresh_manifest_timeout_ms: u64,
    /// Manifest fetch rounds.
    pub bulk_refresh_manifest_max_attempts: u32,
    /// Patch round timeout.
    pub bulk_refresh_patch_timeout_ms: u64,
    /// Patch rounds after the first.
    pub bulk_refresh_patch_max_retries: u32,
    /// Patches per message.
    pub bulk_refresh_patch_aggregation: usize,

    // ========================================================================
    // Traffic shaping
    // ========================================================================
    /// Token bucket burst size.
    pub token_bucket_capacity: u32,
    /// Token refill rate.
    pub token_bucket_tokens_per_second: u32,
    /// Job release period.
    pub shaper_tick_interval_ms: u64,
    /// Jobs released per shaper tick.
    pub shaper_jobs_per_tick: usize,
    /// Pending job limit.
    pub shaper_max_queue: usize,
    /// A released job fails after this long.
    pub shaper_job_timeout_ms: u64,
    /// Concurrent object restores.
    pub max_active_restores: usize,

    /// Seed for the engine's random source. `None` draws from OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_fragments: 48,
            num_survivors: 5,
            min_fragments_after_insert: 2.0,
            insert_timeout_ms: 30 * SECONDS,

            neighbor_delay_after_join_ms: 5 * SECONDS,
            neighbor_interval_ms: 20 * SECONDS,
            neighbor_timeout_ms: 5 * MINUTES,
            handoff_delay_after_join_ms: 45 * SECONDS,
            handoff_interval_ms: 4 * MINUTES,
            handoff_max_fragments: 10,

            sync_delay_after_join_ms: 30 * SECONDS,
            sync_interval_ms: 5 * MINUTES,
            sync_partners_per_trial: 1,
            sync_max_fragments: 100,
            sync_min_remaining_lifetime_ms: 5 * MINUTES,
            sync_min_quiet_time_ms: 5 * MINUTES,
            sync_bloom_false_positive_rate: 0.05,
            manifest_aggregation_factor: 5,

            fragment_request_max_attempts: 3,
            fragment_request_timeout_ms: 20 * SECONDS,
            restore_timeout_default_ms: 10 * SECONDS,
            restore_timeout_min_ms: 6 * SECONDS,
            restore_timeout_max_ms: 60 * SECONDS,
            restore_timeout_decrement_ms: SECONDS,
            restore_max_boosts: 2,
            restore_max_request_factor: 4.0,
            overall_restore_timeout_ms: 2 * MINUTES,

            gc_interval_ms: 10 * MINUTES,
            gc_max_fragments_per_run: 100,
            local_scan_interval_ms: 10 * MINUTES,
            local_scan_max_fragments_per_run: 20,
            trash_retention_ms: 10 * MINUTES,
            trash_capacity: 500,

            bulk_refresh_threshold: 4,
            bulk_refresh_probe_interval_ms: 3 * SECONDS,
            bulk_refresh_probes_per_tick: 3,
            bulk_refresh_probe_max_attempts: 20,
            bulk_refresh_manifest_timeout_ms: 10 * SECONDS,
            bulk_refresh_manifest_max_attempts: 3,
            bulk_refresh_patch_timeout_ms: 10 * SECONDS,
            bulk_refresh_patch_max_retries: 3,
            bulk_refresh_patch_aggregation: 50,

            token_bucket_capacity: 200,
            token_bucket_tokens_per_second: 20,
            shaper_tick_interval_ms: SECONDS,
            shaper_jobs_per_tick: 3,
            shaper_max_queue: 1000,
            shaper_job_timeout_ms: 5 * MINUTES,
            max_active_restores: 3,

            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) TOML document and validate it.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(input)
            .map_err(|e| TesseraError::invalid(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Receipts needed for an insert or refresh to succeed.
    pub fn min_acceptable(&self) -> usize {
        (self.num_survivors as f64 * self.min_fragments_after_insert).ceil() as usize
    }

    /// Whether a fully answered distribution can reach
    /// [`min_acceptable`](Self::min_acceptable) receipts. With one receipt
    /// per fragment, a quorum above `num_fragments` fails every insert.
    pub fn quorum_reachable(&self) -> bool {
        self.min_acceptable() <= self.num_fragments as usize
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_fragments == 0 {
            return Err(TesseraError::invalid("num_fragments must be positive"));
        }
        if self.num_survivors == 0 || self.num_survivors > self.num_fragments {
            return Err(TesseraError::invalid(format!(
                "num_survivors must be in 1..={}, got {}",
                self.num_fragments, self.num_survivors
            )));
        }
        if self.min_fragments_after_insert.is_nan() || self.min_fragments_after_insert <= 0.0 {
            return Err(TesseraError::invalid(
                "min_fragments_after_insert must be positive",
            ));
        }
        if self.restore_timeout_min_ms > self.restore_timeout_max_ms {
            return Err(TesseraError::invalid(
                "restore_timeout_min_ms exceeds restore_timeout_max_ms",
            ));
        }
        let fp_rate = self.sync_bloom_false_positive_rate;
        if fp_rate.is_nan() || fp_rate <= 0.0 || fp_rate >= 1.0 {
            return Err(TesseraError::invalid(
                "sync_bloom_false_positive_rate must be in (0, 1)",
            ));
        }
        let intervals = [
            ("neighbor_interval_ms", self.neighbor_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("handoff_interval_ms", self.handoff_interval_ms),
            ("gc_interval_ms", self.gc_interval_ms),
            ("local_scan_interval_ms", self.local_scan_interval_ms),
            ("shaper_tick_interval_ms", self.shaper_tick_interval_ms),
            ("insert_timeout_ms", self.insert_timeout_ms),
            ("fragment_request_timeout_ms", self.fragment_request_timeout_ms),
            ("restore_timeout_min_ms", self.restore_timeout_min_ms),
            ("bulk_refresh_probe_interval_ms", self.bulk_refresh_probe_interval_ms),
            ("bulk_refresh_manifest_timeout_ms", self.bulk_refresh_manifest_timeout_ms),
            ("bulk_refresh_patch_timeout_ms", self.bulk_refresh_patch_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(TesseraError::invalid(format!("{name} must be positive")));
        }
        if self.manifest_aggregation_factor == 0 || self.bulk_refresh_patch_aggregation == 0 {
            return Err(TesseraError::invalid("aggregation factors must be positive"));
        }
        if self.max_active_restores == 0 {
            return Err(TesseraError::invalid("max_active_restores must be positive"));
        }
        if !self.quorum_reachable() {
            tracing::warn!(
                num_fragments = self.num_fragments,
                min_acceptable = self.min_acceptable(),
                "Receipt quorum exceeds the fragment count; every insert and refresh will fail"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_acceptable(), 10);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            "num_fragments = 4\nnum_survivors = 2\nrng_seed = 7\n",
        )
        .unwrap();
        assert_eq!(config.num_fragments, 4);
        assert_eq!(config.num_survivors, 2);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.gc_max_fragments_per_run, 100);
    }

    #[test]
    fn survivors_above_fragments_rejected() {
        let result = EngineConfig::from_toml_str("num_fragments = 4\nnum_survivors = 5\n");
        assert_matches!(result, Err(TesseraError::Invalid { .. }));
    }

    #[test]
    fn inverted_restore_timeouts_rejected() {
        let config = EngineConfig {
            restore_timeout_min_ms: 10,
            restore_timeout_max_ms: 5,
            ..EngineConfig::default()
        };
        assert_matches!(config.validate(), Err(TesseraError::Invalid { .. }));
    }

    #[test]
    fn quorum_rounds_up() {
        let config = EngineConfig {
            num_survivors: 2,
            min_fragments_after_insert: 3.0,
            ..EngineConfig::default()
        };
        assert_eq!(config.min_acceptable(), 6);
    }

    #[test]
    fn unreachable_quorum_is_accepted_but_flagged() {
        let config = EngineConfig {
            num_fragments: 4,
            num_survivors: 2,
            min_fragments_after_insert: 3.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.quorum_reachable());

        let exact = EngineConfig {
            min_fragments_after_insert: 2.0,
            ..config
        };
        assert!(exact.quorum_reachable());
        assert!(EngineConfig::default().quorum_reachable());
    }
}
