//! Database-backed calculation cache.
//!
//! Persists calculation results per (user, cache key) so a restarted client can
//! show follow-up buckets before its first recomputation.
//!
//! # Cache invalidation
//! A stored row is discarded (and deleted) when:
//! - `CACHE_METADATA_VERSION` differs from the version it was written with
//! - its payload does not decode
//! - it is past its `expires_at`
//!
//! Every one of these is a plain miss, never an error. Payloads are opaque bincode
//! blobs; nothing outside this module reads them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::CacheStoreError;
use crate::models::FollowUpBuckets;
use crate::store::cache::CacheKey;
use crate::store::db::Database;

/// Increment whenever `FollowUpBuckets` or the classification rules change in a way
/// that makes stored results wrong. All older rows are then silently discarded.
pub const CACHE_METADATA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    metadata_version: u32,
    /// Unix millis when this row was written.
    saved_at: i64,
    buckets: FollowUpBuckets,
}

pub struct PersistedCache {
    db: Arc<Database>,
}

impl PersistedCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(
        &self,
        user_id: &str,
        key: &CacheKey,
        buckets: &FollowUpBuckets,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CacheStoreError> {
        let envelope = CacheEnvelope {
            metadata_version: CACHE_METADATA_VERSION,
            saved_at: Utc::now().timestamp_millis(),
            buckets: buckets.clone(),
        };
        let bytes = bincode::serialize(&envelope)?;

        let conn = self.db.conn();
        let conn = conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO followup_cache
                (user_id, cache_key, payload, expires_at, metadata_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                key.digest(),
                bytes,
                expires_at.timestamp_millis(),
                CACHE_METADATA_VERSION
            ],
        )?;
        Ok(())
    }

    /// Returns the stored buckets, or None on any kind of miss.
    pub fn load(&self, user_id: &str, key: &CacheKey, now: DateTime<Utc>) -> Option<FollowUpBuckets> {
        let digest = key.digest();
        let row: Option<(Vec<u8>, i64, u32)> = {
            let conn = self.db.conn();
            let conn = conn.lock();
            match conn
                .query_row(
                    "SELECT payload, expires_at, metadata_version FROM followup_cache
                     WHERE user_id = ?1 AND cache_key = ?2",
                    params![user_id, digest],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            {
                Ok(row) => row,
                Err(e) => {
                    warn!("persisted cache read failed: {}", e);
                    return None;
                }
            }
        };
        let (payload, expires_at, metadata_version) = row?;

        if metadata_version != CACHE_METADATA_VERSION {
            info!(
                "persisted cache: metadata version mismatch (stored={} current={}), discarding",
                metadata_version, CACHE_METADATA_VERSION
            );
            self.delete(user_id, &digest);
            return None;
        }
        if expires_at <= now.timestamp_millis() {
            debug!(key = %key, "persisted cache entry expired");
            self.delete(user_id, &digest);
            return None;
        }

        match bincode::deserialize::<CacheEnvelope>(&payload) {
            Ok(envelope) if envelope.metadata_version == CACHE_METADATA_VERSION => {
                Some(envelope.buckets)
            }
            Ok(_) | Err(_) => {
                info!(key = %key, "persisted cache: undecodable payload, discarding");
                self.delete(user_id, &digest);
                None
            }
        }
    }

    fn delete(&self, user_id: &str, digest: &str) {
        let conn = self.db.conn();
        let conn = conn.lock();
        if let Err(e) = conn.execute(
            "DELETE FROM followup_cache WHERE user_id = ?1 AND cache_key = ?2",
            params![user_id, digest],
        ) {
            warn!("persisted cache delete failed: {}", e);
        }
    }

    /// Drop every row for `user_id` (their underlying data changed).
    pub fn invalidate_user(&self, user_id: &str) -> Result<usize, CacheStoreError> {
        let conn = self.db.conn();
        let removed = conn
            .lock()
            .execute("DELETE FROM followup_cache WHERE user_id = ?1", params![user_id])?;
        Ok(removed)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheStoreError> {
        let conn = self.db.conn();
        let removed = conn.lock().execute(
            "DELETE FROM followup_cache WHERE expires_at <= ?1 OR metadata_version != ?2",
            params![now.timestamp_millis(), CACHE_METADATA_VERSION],
        )?;
        Ok(removed)
    }

    #[cfg(test)]
    fn row_count(&self) -> i64 {
        self.db
            .conn()
            .lock()
            .query_row("SELECT COUNT(*) FROM followup_cache", [], |row| row.get(0))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StalenessBucket;
    use chrono::Duration;

    fn cache() -> PersistedCache {
        PersistedCache::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn buckets() -> FollowUpBuckets {
        let mut b = FollowUpBuckets::new();
        b.insert(StalenessBucket::Stale30Days, "42".to_string());
        b
    }

    #[test]
    fn test_save_and_load() {
        let cache = cache();
        let key = CacheKey::new(&["42"], &[]);
        let now = Utc::now();

        cache.save("user-1", &key, &buckets(), now + Duration::hours(1)).unwrap();

        assert_eq!(cache.load("user-1", &key, now), Some(buckets()));
        assert_eq!(cache.load("user-2", &key, now), None);
        assert_eq!(cache.load("user-1", &CacheKey::new(&["43"], &[]), now), None);
    }

    #[test]
    fn test_expired_row_is_a_miss_and_deleted() {
        let cache = cache();
        let key = CacheKey::new(&["42"], &[]);
        let now = Utc::now();
        cache.save("user-1", &key, &buckets(), now - Duration::seconds(1)).unwrap();

        assert_eq!(cache.load("user-1", &key, now), None);
        assert_eq!(cache.row_count(), 0);
    }

    #[test]
    fn test_version_mismatch_and_corruption_are_misses() {
        let cache = cache();
        let key = CacheKey::new(&["42"], &[]);
        let other = CacheKey::new(&["7"], &[]);
        let now = Utc::now();
        let expires = (now + Duration::hours(1)).timestamp_millis();
        {
            let conn = cache.db.conn();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO followup_cache VALUES (?1, ?2, ?3, ?4, ?5)",
                params!["u", key.digest(), vec![1u8, 2, 3], expires, CACHE_METADATA_VERSION + 1],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO followup_cache VALUES (?1, ?2, ?3, ?4, ?5)",
                params!["u", other.digest(), vec![0xffu8; 4], expires, CACHE_METADATA_VERSION],
            )
            .unwrap();
        }

        assert_eq!(cache.load("u", &key, now), None);
        assert_eq!(cache.load("u", &other, now), None);
        assert_eq!(cache.row_count(), 0);
    }

    #[test]
    fn test_invalidate_user_and_purge() {
        let cache = cache();
        let now = Utc::now();
        let a = CacheKey::new(&["1"], &[]);
        let b = CacheKey::new(&["2"], &[]);

        cache.save("alice", &a, &buckets(), now + Duration::hours(1)).unwrap();
        cache.save("alice", &b, &buckets(), now - Duration::hours(1)).unwrap();
        cache.save("bob", &a, &buckets(), now + Duration::hours(1)).unwrap();

        assert_eq!(cache.purge_expired(now).unwrap(), 1);
        assert_eq!(cache.invalidate_user("alice").unwrap(), 1);
        assert_eq!(cache.load("bob", &a, now), Some(buckets()));
    }
}
