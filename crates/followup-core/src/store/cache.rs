//! In-memory calculation cache.
//!
//! Results are keyed by the canonical (contact-id set, label filter) signature so
//! the same logical query always hits the same slot regardless of input order.
//!
//! # Validity
//! An entry is served only while it is younger than the TTL and was written at the
//! current data version. `mark_data_changed` bumps the version whenever something
//! that affects classification happens (confirmed activity, contact data change)
//! and drops every entry. Results computed off-thread are stored with
//! `set_if_version` so they cannot resurrect data from before the change.
//!
//! # Atomicity
//! Every operation takes the single inner lock, so two writers can never interleave
//! a partial bucket update for a key.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::models::{ContactId, FollowUpBuckets, LabelFilter, StalenessBucket};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<S: AsRef<str>>(contact_ids: &[S], labels: &[S]) -> Self {
        let mut ids: Vec<&str> = contact_ids.iter().map(AsRef::as_ref).collect();
        let mut labels: Vec<&str> = labels.iter().map(AsRef::as_ref).collect();
        ids.sort_unstable();
        ids.dedup();
        labels.sort_unstable();
        labels.dedup();

        // Length prefixes keep ids containing separators from colliding.
        let mut key = String::new();
        for id in &ids {
            key.push_str(&format!("{}:{}", id.len(), id));
        }
        key.push('|');
        for label in &labels {
            key.push_str(&format!("{}:{}", label.len(), label));
        }
        Self(key)
    }

    pub fn for_filter(contact_ids: &[ContactId], filter: &LabelFilter) -> Self {
        let labels: Vec<&str> = filter.labels().collect();
        let ids: Vec<&str> = contact_ids.iter().map(String::as_str).collect();
        Self::new(ids.as_slice(), labels.as_slice())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-length form for external storage.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys can be huge; the digest prefix is enough to tell them apart in logs.
        write!(f, "{}", &self.digest()[..12])
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub buckets: FollowUpBuckets,
    pub written_at: Instant,
    pub data_version: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    data_version: u64,
}

#[derive(Debug)]
pub struct CalculationCache {
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl CalculationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn data_version(&self) -> u64 {
        self.inner.lock().data_version
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry for `key` if it is still valid. A stale or expired entry is dropped.
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<FollowUpBuckets> {
        let mut inner = self.inner.lock();
        let current_version = inner.data_version;
        let entry = inner.entries.get(key)?;
        let stale = entry.data_version != current_version;
        let expired = now.saturating_duration_since(entry.written_at) >= self.ttl;
        if stale || expired {
            debug!(key = %key, stale, expired, "dropping cache entry");
            inner.entries.remove(key);
            return None;
        }
        Some(entry.buckets.clone())
    }

    pub fn set(&self, key: CacheKey, buckets: FollowUpBuckets, now: Instant) {
        let mut inner = self.inner.lock();
        let data_version = inner.data_version;
        inner.entries.insert(
            key,
            CacheEntry {
                buckets,
                written_at: now,
                data_version,
            },
        );
    }

    /// Store only if the data version is still `expected_version`. Used for results
    /// computed elsewhere that may have been overtaken by a data change meanwhile.
    pub fn set_if_version(
        &self,
        key: CacheKey,
        buckets: FollowUpBuckets,
        now: Instant,
        expected_version: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.data_version != expected_version {
            return false;
        }
        inner.entries.insert(
            key,
            CacheEntry {
                buckets,
                written_at: now,
                data_version: expected_version,
            },
        );
        true
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().entries.clear();
    }

    /// Something classification depends on changed; every existing entry becomes stale.
    pub fn mark_data_changed(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.data_version += 1;
        inner.entries.clear();
        inner.data_version
    }

    /// Remove `contact_id` from `from_bucket` (or its current bucket) in the entry for
    /// `key`, without recomputation. Returns the patched buckets, or None when there
    /// is no entry for the key.
    pub fn apply_optimistic_patch(
        &self,
        key: &CacheKey,
        contact_id: &str,
        from_bucket: Option<StalenessBucket>,
    ) -> Option<FollowUpBuckets> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(key)?;
        if entry.buckets.remove(contact_id, from_bucket).is_some() {
            debug!(key = %key, contact_id, "optimistically removed contact from cached bucket");
        }
        Some(entry.buckets.clone())
    }

    /// Apply the optimistic patch to every entry holding `contact_id`. Returns how many
    /// entries changed.
    pub fn patch_contact_everywhere(&self, contact_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner
            .entries
            .values_mut()
            .filter_map(|entry| entry.buckets.remove(contact_id, None))
            .count()
    }
}

/// Refuses unforced recomputation until the system has been quiet for `min_idle`
/// since the last successful computation.
#[derive(Debug)]
pub struct IdleGate {
    min_idle: Duration,
    last_computed: Mutex<Option<Instant>>,
}

impl IdleGate {
    pub fn new(min_idle: Duration) -> Self {
        Self {
            min_idle,
            last_computed: Mutex::new(None),
        }
    }

    pub fn should_compute(&self, now: Instant, force: bool) -> bool {
        if force {
            return true;
        }
        match *self.last_computed.lock() {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_idle,
        }
    }

    pub fn mark_computed(&self, now: Instant) {
        *self.last_computed.lock() = Some(now);
    }

    pub fn last_computed(&self) -> Option<Instant> {
        *self.last_computed.lock()
    }
}
