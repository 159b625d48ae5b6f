//! Follow-up staleness classification.
//!
//! `classify` is the only place the threshold rules live. Caching, the background
//! scheduler and the runtime all call into it rather than re-deriving buckets.
//!
//! Rules, in order:
//! 1. Converted contacts never need a follow-up.
//! 2. A non-empty label filter keeps only contacts carrying a selected label.
//! 3. No confirmed and no optimistic activity: `NeedsApproach`.
//! 4. Otherwise the 30, 7 and 3 day thresholds are checked from the longest down.
//!    A threshold applies only when the contact is itself at least that old, so a
//!    contact created yesterday never shows up as "stale for 30 days".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{STALE_30_DAYS, STALE_3_DAYS, STALE_7_DAYS};
use crate::models::{ActivityMap, ActivitySummary, Contact, FollowUpBuckets, LabelFilter, StalenessBucket};
use crate::overlay::OverlaySnapshot;

const THRESHOLDS: [(i64, StalenessBucket); 3] = [
    (STALE_30_DAYS, StalenessBucket::Stale30Days),
    (STALE_7_DAYS, StalenessBucket::Stale7Days),
    (STALE_3_DAYS, StalenessBucket::Stale3Days),
];

/// How a contact without a creation timestamp is treated by the age gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingCreationPolicy {
    /// Old enough for every threshold.
    #[default]
    TreatAsOld,
    /// Never old enough; such contacts only ever land in `NeedsApproach`.
    TreatAsNew,
}

#[derive(Debug, Clone)]
pub struct ClassifyContext<'a> {
    pub label_filter: &'a LabelFilter,
    pub now: DateTime<Utc>,
    pub missing_creation: MissingCreationPolicy,
}

impl<'a> ClassifyContext<'a> {
    pub fn new(label_filter: &'a LabelFilter, now: DateTime<Utc>) -> Self {
        Self {
            label_filter,
            now,
            missing_creation: MissingCreationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MissingCreationPolicy) -> Self {
        self.missing_creation = policy;
        self
    }
}

/// Whole days from `from` to `now`, floored. Future timestamps yield negative values.
fn whole_days(from: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - from).num_milliseconds().div_euclid(86_400_000)
}

/// Classify a single contact.
///
/// `optimistic_latest` is the newest not-yet-confirmed activity for the contact, if any.
/// It always competes with the confirmed timestamp by taking the later of the two.
pub fn classify(
    contact: &Contact,
    activity: Option<&ActivitySummary>,
    optimistic_latest: Option<DateTime<Utc>>,
    ctx: &ClassifyContext<'_>,
) -> Option<StalenessBucket> {
    if contact.status.is_terminal() {
        return None;
    }
    if !ctx.label_filter.matches(contact) {
        return None;
    }

    let confirmed = activity.filter(|a| a.has_activity);
    let has_activity = confirmed.is_some() || optimistic_latest.is_some();
    if !has_activity {
        return Some(StalenessBucket::NeedsApproach);
    }

    // Activity flagged without a timestamp cannot be aged.
    let last_activity = match (confirmed.and_then(|a| a.last_activity_at), optimistic_latest) {
        (Some(c), Some(o)) => c.max(o),
        (c, o) => c.or(o)?,
    };
    let days_since_last = whole_days(last_activity, ctx.now);
    let days_since_created = contact
        .created_at
        .map(|created| whole_days(created, ctx.now))
        .unwrap_or(0);

    let old_enough = |threshold: i64| match contact.created_at {
        Some(_) => days_since_created >= threshold,
        None => ctx.missing_creation == MissingCreationPolicy::TreatAsOld,
    };

    THRESHOLDS
        .iter()
        .find(|(threshold, _)| days_since_last >= *threshold && old_enough(*threshold))
        .map(|(_, bucket)| *bucket)
}

/// Classify a whole contact set.
pub fn classify_all(
    contacts: &[Contact],
    activities: &ActivityMap,
    overlay: &OverlaySnapshot,
    ctx: &ClassifyContext<'_>,
) -> FollowUpBuckets {
    classify_all_with_progress(contacts, activities, overlay, ctx, usize::MAX, |_, _| {})
}

/// Same as [`classify_all`], calling `on_progress(processed, total)` every `every`
/// contacts and once more when done.
pub fn classify_all_with_progress<F>(
    contacts: &[Contact],
    activities: &ActivityMap,
    overlay: &OverlaySnapshot,
    ctx: &ClassifyContext<'_>,
    every: usize,
    mut on_progress: F,
) -> FollowUpBuckets
where
    F: FnMut(usize, usize),
{
    let total = contacts.len();
    let every = every.max(1);
    let mut buckets = FollowUpBuckets::new();

    for (index, contact) in contacts.iter().enumerate() {
        let bucket = classify(
            contact,
            activities.get(&contact.id),
            overlay.get(&contact.id).copied(),
            ctx,
        );
        if let Some(bucket) = bucket {
            buckets.insert(bucket, contact.id.clone());
        }

        let processed = index + 1;
        if processed % every == 0 && processed != total {
            on_progress(processed, total);
        }
    }
    on_progress(total, total);

    buckets
}
