//! Batched activity lookup.
//!
//! Contact ids are sent to the backend in fixed-size batches. A failing batch is
//! logged and skipped: its contacts simply have no activity in the outcome. Only
//! when every batch fails is the outcome flagged as a total failure, and even then
//! classification proceeds with the (empty) data.
//!
//! Lookups are tagged with a generation. Starting a new lookup supersedes all
//! earlier ones, and [`ActivityStore::apply`] refuses results from a superseded
//! generation so a slow stale response can never overwrite newer data.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::backend::ActivityBackend;
use crate::models::{ActivityMap, ActivitySummary, ContactId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTicket {
    generation: u64,
}

impl LookupTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupOutcome {
    pub activities: ActivityMap,
    pub total_batches: usize,
    pub failed_batches: usize,
}

impl LookupOutcome {
    /// Every batch failed. An empty request is never a failure.
    pub fn is_total_failure(&self) -> bool {
        self.total_batches > 0 && self.failed_batches == self.total_batches
    }
}

pub struct ActivityLookup {
    backend: Arc<dyn ActivityBackend>,
    batch_size: usize,
    generation: AtomicU64,
}

impl ActivityLookup {
    pub fn new(backend: Arc<dyn ActivityBackend>, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> Arc<dyn ActivityBackend> {
        self.backend.clone()
    }

    /// Start a new lookup generation, superseding every earlier ticket.
    pub fn begin(&self) -> LookupTicket {
        LookupTicket {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn is_current(&self, ticket: LookupTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.generation
    }

    pub async fn fetch(&self, contact_ids: &[ContactId]) -> LookupOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<ContactId> = contact_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut outcome = LookupOutcome::default();
        for (index, batch) in unique.chunks(self.batch_size).enumerate() {
            outcome.total_batches += 1;
            match self.backend.fetch_activities(batch).await {
                Ok(map) => {
                    // Only keep answers for ids we asked about.
                    for id in batch {
                        if let Some(summary) = map.get(id) {
                            outcome.activities.insert(id.clone(), *summary);
                        }
                    }
                }
                Err(e) => {
                    outcome.failed_batches += 1;
                    warn!(
                        batch = index,
                        size = batch.len(),
                        "activity lookup batch failed, treating contacts as inactive: {}",
                        e
                    );
                }
            }
        }

        if outcome.is_total_failure() {
            error!(
                batches = outcome.total_batches,
                "activity lookup failed for every batch"
            );
        } else {
            debug!(
                contacts = unique.len(),
                batches = outcome.total_batches,
                failed = outcome.failed_batches,
                "activity lookup finished"
            );
        }
        outcome
    }
}

/// Latest confirmed activity data known to the runtime.
///
/// Writes confirmed locally are remembered separately and folded into every full
/// lookup result, so a lookup that was already in flight when the write landed
/// cannot make the contact look inactive again.
#[derive(Debug, Default)]
pub struct ActivityStore {
    activities: ActivityMap,
    confirmed_writes: ActivityMap,
    applied_generation: u64,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> &ActivityMap {
        &self.activities
    }

    pub fn get(&self, contact_id: &str) -> Option<&ActivitySummary> {
        self.activities.get(contact_id)
    }

    /// Replace the data with a full lookup result. Refused when `ticket` is no longer
    /// current or older than what was already applied.
    pub fn apply(
        &mut self,
        lookup: &ActivityLookup,
        ticket: LookupTicket,
        outcome: LookupOutcome,
    ) -> bool {
        if !lookup.is_current(ticket) || ticket.generation < self.applied_generation {
            debug!(
                generation = ticket.generation,
                "discarding superseded activity lookup"
            );
            return false;
        }
        self.activities = outcome.activities;
        for (id, summary) in &self.confirmed_writes {
            self.activities.entry(id.clone()).or_default().merge(summary);
        }
        self.applied_generation = ticket.generation;
        true
    }

    /// Merge data for individual contacts. Newer timestamps win; nothing is removed.
    pub fn merge(&mut self, activities: &ActivityMap) {
        for (id, summary) in activities {
            self.activities.entry(id.clone()).or_default().merge(summary);
        }
    }

    /// Remember an activity the backend confirmed for this session.
    pub fn record_confirmed(&mut self, contact_id: &str, summary: ActivitySummary) {
        self.confirmed_writes
            .entry(contact_id.to_string())
            .or_default()
            .merge(&summary);
        self.activities
            .entry(contact_id.to_string())
            .or_default()
            .merge(&summary);
    }

    pub fn clear(&mut self) {
        self.activities.clear();
        self.confirmed_writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::models::ActivityRecord;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    /// Fails every batch containing `poisoned`; records batch sizes.
    struct FlakyBackend {
        poisoned: Option<String>,
        batches: Mutex<Vec<usize>>,
    }

    impl ActivityBackend for FlakyBackend {
        fn fetch_activities<'a>(
            &'a self,
            contact_ids: &'a [ContactId],
        ) -> BoxFuture<'a, Result<ActivityMap, BackendError>> {
            Box::pin(async move {
                self.batches.lock().push(contact_ids.len());
                if let Some(p) = &self.poisoned {
                    if contact_ids.contains(p) {
                        return Err(BackendError::Unavailable);
                    }
                }
                Ok(contact_ids
                    .iter()
                    .map(|id| (id.clone(), ActivitySummary::at(Utc::now())))
                    .collect())
            })
        }

        fn persist_activity<'a>(
            &'a self,
            _activity: &'a ActivityRecord,
        ) -> BoxFuture<'a, Result<(), BackendError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn ids(n: usize) -> Vec<ContactId> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    fn lookup(poisoned: Option<&str>) -> (Arc<FlakyBackend>, ActivityLookup) {
        let backend = Arc::new(FlakyBackend {
            poisoned: poisoned.map(str::to_string),
            batches: Mutex::new(Vec::new()),
        });
        let lookup = ActivityLookup::new(backend.clone(), 50);
        (backend, lookup)
    }

    #[test]
    fn test_batches_of_fifty() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (backend, lookup) = lookup(None);

        let outcome = rt.block_on(lookup.fetch(&ids(120)));

        assert_eq!(*backend.batches.lock(), vec![50, 50, 20]);
        assert_eq!(outcome.activities.len(), 120);
        assert_eq!(outcome.failed_batches, 0);
    }

    #[test]
    fn test_duplicate_ids_fetched_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (backend, lookup) = lookup(None);
        let mut list = ids(3);
        list.extend(ids(3));

        rt.block_on(lookup.fetch(&list));
        assert_eq!(*backend.batches.lock(), vec![3]);
    }

    #[test]
    fn test_failed_batch_is_skipped() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (_backend, lookup) = lookup(Some("c60"));

        let outcome = rt.block_on(lookup.fetch(&ids(120)));

        assert_eq!(outcome.failed_batches, 1);
        assert!(!outcome.is_total_failure());
        assert_eq!(outcome.activities.len(), 70);
        assert!(!outcome.activities.contains_key("c60"));
        assert!(outcome.activities.contains_key("c0"));
    }

    #[test]
    fn test_total_failure() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (_backend, lookup) = lookup(Some("c0"));

        let outcome = rt.block_on(lookup.fetch(&ids(10)));
        assert!(outcome.is_total_failure());
        assert!(outcome.activities.is_empty());

        let empty = rt.block_on(lookup.fetch(&[]));
        assert!(!empty.is_total_failure());
    }

    #[test]
    fn test_superseded_results_discarded() {
        let (_backend, lookup) = lookup(None);
        let mut store = ActivityStore::new();

        let stale = lookup.begin();
        let fresh = lookup.begin();
        assert!(!lookup.is_current(stale));

        let mut newer = LookupOutcome::default();
        newer.activities.insert("a".to_string(), ActivitySummary::at(Utc::now()));
        assert!(store.apply(&lookup, fresh, newer));

        assert!(!store.apply(&lookup, stale, LookupOutcome::default()));
        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_merge_keeps_newer() {
        let mut store = ActivityStore::new();
        let now = Utc::now();
        let older = now - chrono::Duration::days(3);

        let mut first = ActivityMap::new();
        first.insert("a".to_string(), ActivitySummary::at(now));
        store.merge(&first);

        let mut second = ActivityMap::new();
        second.insert("a".to_string(), ActivitySummary::at(older));
        store.merge(&second);

        assert_eq!(store.get("a").unwrap().last_activity_at, Some(now));
    }

    #[test]
    fn test_confirmed_writes_survive_full_lookup() {
        let (_backend, lookup) = lookup(None);
        let mut store = ActivityStore::new();
        let written = Utc::now();

        let ticket = lookup.begin();
        store.record_confirmed("a", ActivitySummary::at(written));
        // Lookup started before the write and knows nothing about it.
        assert!(store.apply(&lookup, ticket, LookupOutcome::default()));

        assert_eq!(store.get("a").unwrap().last_activity_at, Some(written));
    }
}
