//! Traffic shaper.
//!
//! Recovery traffic is bounded in two ways: a [`TokenBucket`] charged for
//! every recovery-driven send, and a deduplicated job queue whose jobs are
//! released a few per tick while the number of active object restores
//! stays under a ceiling. Restores are counted through [`RestorePermit`]s,
//! which can only be obtained from and returned to the shaper.

use crate::engine::OpId;
use crate::message::MessageTag;
use std::collections::{BTreeMap, VecDeque};
use tessera_core::{EngineConfig, FragmentKey, Manifest, Result, TesseraError, Timestamp};

/// Token bucket with an explicit clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens_per_second: u32,
    tokens: u32,
    last_refill: Timestamp,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, tokens_per_second: u32, now: Timestamp) -> Self {
        Self {
            capacity,
            tokens_per_second,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Timestamp) {
        let elapsed = now.saturating_sub(self.last_refill);
        let earned = elapsed.saturating_mul(self.tokens_per_second as u64) / 1_000;
        if earned > 0 {
            self.tokens = (self.tokens as u64 + earned).min(self.capacity as u64) as u32;
            // Keep the remainder so slow refill rates still make progress
            self.last_refill += earned * 1_000 / self.tokens_per_second.max(1) as u64;
        }
        if self.tokens == self.capacity {
            self.last_refill = now;
        }
    }

    /// Consume `cost` tokens if available.
    pub fn try_consume(&mut self, cost: u32, now: Timestamp) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Timestamp) -> u32 {
        self.refill(now);
        self.tokens
    }
}

/// Proof that an object restore is counted as active.
///
/// Must be handed back through [`TrafficShaper::release_restore`].
#[derive(Debug)]
#[must_use = "restore permits must be released"]
pub struct RestorePermit(());

/// A queued fragment repair.
#[derive(Debug, Clone)]
pub struct RepairJob {
    /// Fragment to regenerate.
    pub key: FragmentKey,
    /// Manifest the regenerated fragment must validate against.
    pub manifest: Manifest,
    /// Protocol that requested the repair.
    pub origin: MessageTag,
    /// When the job was queued.
    pub queued_at: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    started: Timestamp,
    op: Option<OpId>,
}

/// Token bucket, repair job queue and restore counter.
#[derive(Debug)]
pub struct TrafficShaper {
    bucket: TokenBucket,
    queue: VecDeque<RepairJob>,
    queued: BTreeMap<FragmentKey, Timestamp>,
    active: BTreeMap<FragmentKey, ActiveJob>,
    active_restores: usize,
    max_active_restores: usize,
    max_queue: usize,
    jobs_per_tick: usize,
    job_timeout: u64,
}

impl TrafficShaper {
    /// Shaper configured from `config`.
    pub fn new(config: &EngineConfig, now: Timestamp) -> Self {
        Self {
            bucket: TokenBucket::new(
                config.token_bucket_capacity,
                config.token_bucket_tokens_per_second,
                now,
            ),
            queue: VecDeque::new(),
            queued: BTreeMap::new(),
            active: BTreeMap::new(),
            active_restores: 0,
            max_active_restores: config.max_active_restores,
            max_queue: config.shaper_max_queue,
            jobs_per_tick: config.shaper_jobs_per_tick,
            job_timeout: config.shaper_job_timeout_ms,
        }
    }

    /// Charge a recovery-driven send.
    pub fn charge(&mut self, cost: u32, now: Timestamp) -> bool {
        self.bucket.try_consume(cost, now)
    }

    /// Tokens currently available.
    pub fn tokens(&mut self, now: Timestamp) -> u32 {
        self.bucket.available(now)
    }

    /// Queue a repair. A key already queued or in progress fails fast.
    pub fn enqueue(&mut self, job: RepairJob) -> Result<()> {
        if self.queued.contains_key(&job.key) || self.active.contains_key(&job.key) {
            return Err(TesseraError::busy(format!("repair of {} already pending", job.key)));
        }
        if self.queue.len() >= self.max_queue {
            return Err(TesseraError::busy("repair queue full"));
        }
        self.queued.insert(job.key, job.queued_at);
        self.queue.push_back(job);
        Ok(())
    }

    /// Whether a repair for `key` is queued or running.
    pub fn is_pending(&self, key: &FragmentKey) -> bool {
        self.queued.contains_key(key) || self.active.contains_key(key)
    }

    /// Jobs to start now: at most the per-tick cap, each paid for with a
    /// token, and only while active restores are below the ceiling.
    pub fn release(&mut self, now: Timestamp) -> Vec<RepairJob> {
        let mut released = Vec::new();
        while released.len() < self.jobs_per_tick
            && self.active_restores < self.max_active_restores
            && !self.queue.is_empty()
        {
            if !self.bucket.try_consume(1, now) {
                tracing::debug!(queued = self.queue.len(), "Token bucket empty; holding repairs");
                break;
            }
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&job.key);
            self.active.insert(
                job.key,
                ActiveJob {
                    started: now,
                    op: None,
                },
            );
            released.push(job);
        }
        released
    }

    /// Record the operation running a released job.
    pub fn assign(&mut self, key: &FragmentKey, op: OpId) {
        if let Some(job) = self.active.get_mut(key) {
            job.op = Some(op);
        }
    }

    /// Mark a released job finished, successfully or not.
    pub fn finish(&mut self, key: &FragmentKey) {
        self.active.remove(key);
    }

    /// Active jobs that have run longer than the job timeout, with the
    /// operation running each.
    pub fn overdue(&self, now: Timestamp) -> Vec<(FragmentKey, Option<OpId>)> {
        self.active
            .iter()
            .filter(|(_, job)| now.saturating_sub(job.started) > self.job_timeout)
            .map(|(key, job)| (*key, job.op))
            .collect()
    }

    /// Count a restore as active.
    pub fn acquire_restore(&mut self) -> RestorePermit {
        self.active_restores += 1;
        RestorePermit(())
    }

    /// Return a permit.
    pub fn release_restore(&mut self, permit: RestorePermit) {
        let RestorePermit(()) = permit;
        self.active_restores = self.active_restores.saturating_sub(1);
    }

    /// Restores in progress.
    pub fn active_restores(&self) -> usize {
        self.active_restores
    }

    /// Jobs waiting.
    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    /// Jobs running.
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tessera_core::{Hash32, RingId, VersionKey};

    fn job(index: u32) -> RepairJob {
        RepairJob {
            key: VersionKey::new(RingId(1), 0).fragment(index),
            manifest: Manifest {
                object_hash: Hash32::of(b"o"),
                fragment_hashes: vec![],
                expiration: 0,
                signature: vec![],
            },
            origin: MessageTag::LocalScan,
            queued_at: 0,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            token_bucket_capacity: 5,
            token_bucket_tokens_per_second: 2,
            shaper_jobs_per_tick: 2,
            max_active_restores: 3,
            shaper_max_queue: 4,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(4, 2, 0);
        assert!(bucket.try_consume(4, 0));
        assert!(!bucket.try_consume(1, 0));
        assert!(!bucket.try_consume(1, 400));
        assert!(bucket.try_consume(1, 500));
        assert_eq!(bucket.available(10_000), 4);
    }

    #[test]
    fn duplicate_job_fails_fast() {
        let mut shaper = TrafficShaper::new(&config(), 0);
        shaper.enqueue(job(1)).unwrap();
        assert_matches!(shaper.enqueue(job(1)), Err(TesseraError::Busy { .. }));
        let released = shaper.release(0);
        assert_eq!(released.len(), 1);
        // Still rejected while running
        assert_matches!(shaper.enqueue(job(1)), Err(TesseraError::Busy { .. }));
        shaper.finish(&job(1).key);
        assert!(shaper.enqueue(job(1)).is_ok());
    }

    #[test]
    fn release_respects_per_tick_cap_and_restores() {
        let mut shaper = TrafficShaper::new(&config(), 0);
        for index in 0..4 {
            shaper.enqueue(job(index)).unwrap();
        }
        assert_eq!(shaper.release(0).len(), 2);
        let permits: Vec<RestorePermit> = (0..3).map(|_| shaper.acquire_restore()).collect();
        assert!(shaper.release(0).is_empty());
        for permit in permits {
            shaper.release_restore(permit);
        }
        assert_eq!(shaper.release(0).len(), 2);
        assert_eq!(shaper.pending_jobs(), 0);
        assert_eq!(shaper.active_jobs(), 4);
    }

    #[test]
    fn overdue_jobs_report_their_operation() {
        let mut shaper = TrafficShaper::new(
            &EngineConfig {
                shaper_job_timeout_ms: 100,
                ..config()
            },
            0,
        );
        shaper.enqueue(job(0)).unwrap();
        let released = shaper.release(0);
        shaper.assign(&released[0].key, OpId(9));
        assert!(shaper.overdue(100).is_empty());
        assert_eq!(shaper.overdue(101), vec![(job(0).key, Some(OpId(9)))]);
    }

    #[test]
    fn queue_is_bounded() {
        let mut shaper = TrafficShaper::new(&config(), 0);
        for index in 0..4 {
            shaper.enqueue(job(index)).unwrap();
        }
        assert_matches!(shaper.enqueue(job(9)), Err(TesseraError::Busy { .. }));
    }

    #[test]
    fn empty_bucket_holds_jobs() {
        let mut shaper = TrafficShaper::new(
            &EngineConfig {
                token_bucket_capacity: 1,
                ..config()
            },
            0,
        );
        shaper.enqueue(job(0)).unwrap();
        shaper.enqueue(job(1)).unwrap();
        assert_eq!(shaper.release(0).len(), 1);
        assert!(shaper.release(0).is_empty());
        assert_eq!(shaper.release(500).len(), 1);
    }
}
