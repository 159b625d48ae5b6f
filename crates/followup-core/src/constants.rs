//! Application-wide constants
//!
//! Centralized location for thresholds and default tuning values
//! that are used across multiple modules.

use std::time::Duration;

/// Staleness thresholds in days, checked from the longest to the shortest.
pub const STALE_30_DAYS: i64 = 30;
pub const STALE_7_DAYS: i64 = 7;
pub const STALE_3_DAYS: i64 = 3;

/// Maximum number of contact ids sent to the backend in one lookup request.
pub const DEFAULT_LOOKUP_BATCH_SIZE: usize = 50;

/// Calculation results older than this are recomputed.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60); // 5 minutes

/// Minimum quiet period between two unforced recomputations.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between a confirmed write and removal of its optimistic entry.
pub const DEFAULT_OPTIMISTIC_GRACE: Duration = Duration::from_secs(1);

/// Hard upper bound on the lifetime of any optimistic entry.
pub const DEFAULT_OPTIMISTIC_TIMEOUT: Duration = Duration::from_secs(30);

/// Background calculations report progress after this many contacts.
pub const DEFAULT_PROGRESS_EVERY: usize = 10;

/// Contact sets at least this large are classified off the calling thread.
pub const DEFAULT_BACKGROUND_THRESHOLD: usize = 200;

/// Expiry for rows in the persisted calculation cache (24 hours).
pub const DEFAULT_PERSISTED_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Environment variable that enables the debug log file.
pub const LOG_FILE_ENV: &str = "FOLLOWUP_LOG_FILE";
