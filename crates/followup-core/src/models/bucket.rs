use serde::{Deserialize, Serialize};

use super::ContactId;

/// Follow-up urgency. A contact is in at most one bucket; fresh contacts are in none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StalenessBucket {
    NeedsApproach,
    Stale3Days,
    Stale7Days,
    Stale30Days,
}

impl StalenessBucket {
    pub const ALL: [StalenessBucket; 4] = [
        Self::NeedsApproach,
        Self::Stale3Days,
        Self::Stale7Days,
        Self::Stale30Days,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::NeedsApproach => "needs approach",
            Self::Stale3Days => "3d",
            Self::Stale7Days => "7d",
            Self::Stale30Days => "30d",
        }
    }
}

/// The four bucket lists of a calculation. Each list is sorted by contact id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpBuckets {
    pub needs_approach: Vec<ContactId>,
    pub stale_3_days: Vec<ContactId>,
    pub stale_7_days: Vec<ContactId>,
    pub stale_30_days: Vec<ContactId>,
}

impl FollowUpBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: StalenessBucket) -> &[ContactId] {
        match bucket {
            StalenessBucket::NeedsApproach => &self.needs_approach,
            StalenessBucket::Stale3Days => &self.stale_3_days,
            StalenessBucket::Stale7Days => &self.stale_7_days,
            StalenessBucket::Stale30Days => &self.stale_30_days,
        }
    }

    fn get_mut(&mut self, bucket: StalenessBucket) -> &mut Vec<ContactId> {
        match bucket {
            StalenessBucket::NeedsApproach => &mut self.needs_approach,
            StalenessBucket::Stale3Days => &mut self.stale_3_days,
            StalenessBucket::Stale7Days => &mut self.stale_7_days,
            StalenessBucket::Stale30Days => &mut self.stale_30_days,
        }
    }

    /// Insert keeping the list sorted. Ignores ids already present in the bucket.
    pub fn insert(&mut self, bucket: StalenessBucket, contact_id: ContactId) {
        let list = self.get_mut(bucket);
        if let Err(pos) = list.binary_search(&contact_id) {
            list.insert(pos, contact_id);
        }
    }

    pub fn bucket_of(&self, contact_id: &str) -> Option<StalenessBucket> {
        StalenessBucket::ALL
            .into_iter()
            .find(|b| self.get(*b).iter().any(|id| id == contact_id))
    }

    /// Remove a contact from `from`, or from whichever bucket holds it when `from` is None.
    /// Returns the bucket it was removed from.
    pub fn remove(
        &mut self,
        contact_id: &str,
        from: Option<StalenessBucket>,
    ) -> Option<StalenessBucket> {
        let bucket = match from {
            Some(b) => b,
            None => self.bucket_of(contact_id)?,
        };
        let list = self.get_mut(bucket);
        let pos = list.iter().position(|id| id == contact_id)?;
        list.remove(pos);
        Some(bucket)
    }

    pub fn total(&self) -> usize {
        StalenessBucket::ALL.iter().map(|b| self.get(*b).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sorted_and_dedup() {
        let mut buckets = FollowUpBuckets::new();
        buckets.insert(StalenessBucket::Stale7Days, "b".to_string());
        buckets.insert(StalenessBucket::Stale7Days, "a".to_string());
        buckets.insert(StalenessBucket::Stale7Days, "b".to_string());

        assert_eq!(buckets.stale_7_days, vec!["a", "b"]);
        assert_eq!(buckets.total(), 2);
    }

    #[test]
    fn test_remove_with_and_without_hint() {
        let mut buckets = FollowUpBuckets::new();
        buckets.insert(StalenessBucket::NeedsApproach, "1".to_string());
        buckets.insert(StalenessBucket::Stale30Days, "2".to_string());

        assert_eq!(buckets.remove("2", None), Some(StalenessBucket::Stale30Days));
        assert_eq!(buckets.remove("1", Some(StalenessBucket::Stale3Days)), None);
        assert_eq!(buckets.bucket_of("1"), Some(StalenessBucket::NeedsApproach));
        assert_eq!(buckets.remove("missing", None), None);
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(FollowUpBuckets::new()).unwrap();
        for key in ["needsApproach", "stale3Days", "stale7Days", "stale30Days"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
