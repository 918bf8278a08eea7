//! Garbage collection, local scan and the shaper tick.

use super::Engine;
use crate::message::MessageTag;
use crate::shaper::RepairJob;
use tessera_core::{FragmentKey, Timestamp};
use tessera_store::FragmentStore;

/// Where the next local scan resumes.
#[derive(Debug, Default)]
pub(crate) struct LocalScanState {
    cursor: Option<FragmentKey>,
}

/// Keys one local scan run looks at.
#[derive(Debug, PartialEq, Eq)]
struct ScanWindow {
    /// Unexpired keys among the examined ones.
    live: Vec<FragmentKey>,
    examined: usize,
    /// Last examined key, or `None` once the walk reached the end.
    resume: Option<FragmentKey>,
}

/// Examine at most `cap` stored keys after `cursor`.
fn scan_window(store: &FragmentStore, cursor: Option<FragmentKey>, cap: usize, now: Timestamp) -> ScanWindow {
    // One extra key tells whether the walk reached the end of the store
    let mut window: Vec<(FragmentKey, bool)> = store
        .entries_after(cursor)
        .take(cap.saturating_add(1))
        .map(|(key, metadata)| (*key, metadata.is_expired(now)))
        .collect();
    let more = window.len() > cap;
    window.truncate(cap);
    ScanWindow {
        examined: window.len(),
        resume: if more { window.last().map(|(key, _)| *key) } else { None },
        live: window
            .into_iter()
            .filter(|(_, expired)| !expired)
            .map(|(key, _)| key)
            .collect(),
    }
}

impl Engine {
    /// Delete expired fragments, at most the per-run cap, and purge the trash.
    pub(super) fn collect_garbage(&mut self, now: Timestamp) {
        let expired = self.store.expired(now, self.config.gc_max_fragments_per_run);
        let mut deleted = 0usize;
        for key in &expired {
            match self.store.remove(key) {
                Ok(_) => deleted += 1,
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %key, error = %e, "Deleting expired fragment failed");
                }
            }
        }
        let purged = self.trash.purge(now);
        if deleted > 0 || purged > 0 {
            tracing::info!(
                node = %self.local_id,
                deleted,
                purged,
                remaining = self.store.len(),
                "Garbage collected"
            );
        }
    }

    /// Queue repairs for missing in-range siblings of held fragments.
    pub(super) fn local_scan(&mut self, state: &mut LocalScanState, now: Timestamp) {
        let n = self.config.num_fragments;
        let cap = self.config.local_scan_max_fragments_per_run;
        let window = scan_window(&self.store, state.cursor, cap, now);
        state.cursor = window.resume;

        let mut queued = 0usize;
        let examined = window.examined;
        for key in window.live {
            if queued >= cap {
                break;
            }
            let index = key.index;
            let mut siblings = vec![(index + 1) % n, (index + n - 1) % n];
            siblings.dedup();
            let missing: Vec<FragmentKey> = siblings
                .into_iter()
                .filter(|sibling| *sibling != index)
                .map(|sibling| key.with_index(sibling))
                .filter(|sibling| {
                    self.is_responsible(sibling)
                        && !self.store.contains(sibling)
                        && !self.shaper.is_pending(sibling)
                })
                .collect();
            if missing.is_empty() {
                continue;
            }
            let manifest = match self.store.get(&key) {
                Ok(Some(stored)) => stored.manifest,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(node = %self.local_id, key = %key, error = %e, "Store read failed during local scan");
                    continue;
                }
            };
            for sibling in missing {
                if queued >= cap {
                    break;
                }
                let job = RepairJob {
                    key: sibling,
                    manifest: manifest.clone(),
                    origin: MessageTag::LocalScan,
                    queued_at: now,
                };
                match self.shaper.enqueue(job) {
                    Ok(()) => queued += 1,
                    Err(e) => {
                        tracing::debug!(node = %self.local_id, key = %sibling, error = %e, "Sibling repair not queued");
                    }
                }
            }
        }
        tracing::debug!(node = %self.local_id, examined, queued, "Local scan done");
    }

    /// Retire overdue repairs and start the jobs the shaper releases.
    pub(super) fn shaper_tick(&mut self, now: Timestamp) {
        for (key, op) in self.shaper.overdue(now) {
            tracing::warn!(node = %self.local_id, key = %key, "Repair job overdue; abandoning");
            if let Some(op) = op {
                self.registry.terminate(op);
            }
            self.shaper.finish(&key);
        }
        for job in self.shaper.release(now) {
            let key = job.key;
            tracing::debug!(node = %self.local_id, key = %key, origin = %job.origin, "Starting repair");
            let id = self.start_retrieve_fragment(job, now);
            self.shaper.assign(&key, id);
        }
    }
}
