//! Optimistic activity overlay.
//!
//! Activities the user just logged are recorded here synchronously so the
//! follow-up view reflects them before the backend confirms the write.
//!
//! ## Lifecycle
//! - `record` creates a `Pending` entry.
//! - A confirmed write marks it `Succeeded`; the runtime removes it after a short
//!   grace delay once refreshed activity data is in place.
//! - A failed write marks it `Failed` so the UI can show a sync indicator.
//! - `expire` drops anything older than the hard timeout, whatever its status.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{ActivityDescriptor, ContactId, OptimisticActivity, SyncStatus};

/// Owned copy of the overlay reduced to the latest optimistic timestamp per contact.
/// This is what crosses into the background calculation.
pub type OverlaySnapshot = HashMap<ContactId, DateTime<Utc>>;

#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    entries: HashMap<ContactId, Vec<OptimisticActivity>>,
}

impl OptimisticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // ===== Getters =====

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, contact_id: &str) -> &[OptimisticActivity] {
        self.entries.get(contact_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, local_id: Uuid) -> Option<&OptimisticActivity> {
        self.entries
            .values()
            .flatten()
            .find(|a| a.local_id == local_id)
    }

    /// Newest optimistic occurrence for a contact. Failed entries still count until
    /// they expire: the user did perform the action.
    pub fn latest_for(&self, contact_id: &str) -> Option<DateTime<Utc>> {
        self.entries_for(contact_id)
            .iter()
            .map(|a| a.occurred_at)
            .max()
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        self.entries
            .keys()
            .filter_map(|id| self.latest_for(id).map(|ts| (id.clone(), ts)))
            .collect()
    }

    pub fn all(&self) -> Vec<OptimisticActivity> {
        let mut all: Vec<_> = self.entries.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        all
    }

    // ===== Mutations =====

    pub fn record(
        &mut self,
        contact_id: impl Into<ContactId>,
        descriptor: ActivityDescriptor,
        now: DateTime<Utc>,
    ) -> OptimisticActivity {
        let activity = OptimisticActivity {
            local_id: Uuid::new_v4(),
            contact_id: contact_id.into(),
            kind: descriptor.kind,
            details: descriptor.details,
            occurred_at: descriptor.occurred_at.unwrap_or(now),
            recorded_at: now,
            status: SyncStatus::Pending,
        };
        self.entries
            .entry(activity.contact_id.clone())
            .or_default()
            .push(activity.clone());
        activity
    }

    pub fn mark_succeeded(&mut self, local_id: Uuid) -> bool {
        self.set_status(local_id, SyncStatus::Succeeded)
    }

    pub fn mark_failed(&mut self, local_id: Uuid) -> bool {
        self.set_status(local_id, SyncStatus::Failed)
    }

    fn set_status(&mut self, local_id: Uuid, status: SyncStatus) -> bool {
        match self
            .entries
            .values_mut()
            .flatten()
            .find(|a| a.local_id == local_id)
        {
            Some(activity) => {
                activity.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, local_id: Uuid) -> Option<OptimisticActivity> {
        let contact_id = self.get(local_id)?.contact_id.clone();
        let list = self.entries.get_mut(&contact_id)?;
        let pos = list.iter().position(|a| a.local_id == local_id)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.entries.remove(&contact_id);
        }
        Some(removed)
    }

    /// Drop every entry recorded more than `max_age` before `now`. Returns what was dropped.
    pub fn expire(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<OptimisticActivity> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();
        self.entries.retain(|_, list| {
            list.retain(|a| {
                let keep = now - a.recorded_at < max_age;
                if !keep {
                    expired.push(a.clone());
                }
                keep
            });
            !list.is_empty()
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivityKind;

    fn call() -> ActivityDescriptor {
        ActivityDescriptor::new(ActivityKind::Call)
    }

    #[test]
    fn test_record_is_pending_and_visible() {
        let mut overlay = OptimisticOverlay::new();
        let now = Utc::now();

        let activity = overlay.record("c1", call().with_details("left voicemail"), now);

        assert_eq!(activity.status, SyncStatus::Pending);
        assert_eq!(activity.occurred_at, now);
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay.latest_for("c1"), Some(now));
        assert_eq!(overlay.latest_for("c2"), None);
        assert_eq!(overlay.get(activity.local_id).unwrap().details.as_deref(), Some("left voicemail"));
    }

    #[test]
    fn test_latest_and_snapshot() {
        let mut overlay = OptimisticOverlay::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::hours(2);

        overlay.record("c1", call().occurred_at(earlier), now);
        overlay.record("c1", call(), now);
        overlay.record("c2", call().occurred_at(earlier), now);

        let snapshot = overlay.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["c1"], now);
        assert_eq!(snapshot["c2"], earlier);
    }

    #[test]
    fn test_status_transitions_and_remove() {
        let mut overlay = OptimisticOverlay::new();
        let a = overlay.record("c1", call(), Utc::now());
        let b = overlay.record("c1", call(), Utc::now());

        assert!(overlay.mark_failed(a.local_id));
        assert!(overlay.mark_succeeded(b.local_id));
        assert_eq!(overlay.get(a.local_id).unwrap().status, SyncStatus::Failed);
        assert_eq!(overlay.get(b.local_id).unwrap().status, SyncStatus::Succeeded);

        assert!(overlay.remove(a.local_id).is_some());
        assert!(overlay.remove(a.local_id).is_none());
        assert!(overlay.remove(b.local_id).is_some());
        assert!(overlay.is_empty());
        assert!(!overlay.mark_failed(b.local_id));
    }

    #[test]
    fn test_expire_ignores_status() {
        let mut overlay = OptimisticOverlay::new();
        let now = Utc::now();
        let old = overlay.record("c1", call(), now - chrono::Duration::seconds(45));
        overlay.mark_failed(old.local_id);
        let fresh = overlay.record("c1", call(), now - chrono::Duration::seconds(5));

        let expired = overlay.expire(now, Duration::from_secs(30));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].local_id, old.local_id);
        assert!(overlay.get(fresh.local_id).is_some());
        assert_eq!(overlay.len(), 1);
    }
}
