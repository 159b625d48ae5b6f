pub mod activity;
pub mod bucket;
pub mod contact;

pub use activity::{
    summarize, ActivityDescriptor, ActivityKind, ActivityMap, ActivityRecord, ActivitySummary,
    OptimisticActivity, SyncStatus,
};
pub use bucket::{FollowUpBuckets, StalenessBucket};
pub use contact::{Contact, ContactId, ContactRecord, ContactStatus, LabelFilter, RawId};
