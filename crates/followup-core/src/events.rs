use uuid::Uuid;

use crate::models::ContactId;

/// Outcomes of background work, drained by the UI from `FollowUpRuntime::take_event_rx`.
///
/// Failures arrive here instead of as errors: every one of them has already degraded
/// to a documented default (no activity, failed overlay entry, not-yet-available).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A full activity lookup was applied
    ActivitiesRefreshed {
        generation: u64,
        contacts: usize,
        failed_batches: usize,
    },
    /// Every lookup batch failed; UI should show a soft error banner
    ActivityLookupFailed { message: String },
    /// Optimistic activity confirmed by the backend
    ActivitySynced { local_id: Uuid, contact_id: ContactId },
    /// Optimistic activity could not be persisted; UI should show a toast
    ActivitySyncFailed {
        local_id: Uuid,
        contact_id: ContactId,
        message: String,
    },
    /// Optimistic entry reached its hard timeout and was dropped
    OptimisticExpired { local_id: Uuid, contact_id: ContactId },
    CalculationProgress {
        job_id: u64,
        processed: usize,
        total: usize,
    },
    /// Background result is now in the cache
    CalculationCompleted { job_id: u64 },
    /// Background calculation failed; the view stays "not yet available"
    CalculationFailed { job_id: u64, message: String },
}
