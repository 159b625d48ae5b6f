use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, warn};

use crate::backend::ActivityBackend;
use crate::config::FollowUpConfig;
use crate::events::CoreEvent;
use crate::lookup::{ActivityLookup, ActivityStore, LookupTicket};
use crate::models::{
    ActivityDescriptor, ActivitySummary, Contact, ContactId, FollowUpBuckets, LabelFilter,
    OptimisticActivity, SyncStatus,
};
use crate::overlay::{OptimisticOverlay, OverlaySnapshot};
use crate::scheduler::{calculate, CalculationPayload, CalculationScheduler, SchedulerUpdate};
use crate::store::{CacheKey, CalculationCache, Database, IdleGate, PersistedCache};

/// Where the buckets returned by [`FollowUpRuntime::follow_up_buckets`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    /// Served from the in-memory or persisted cache
    Cached,
    /// Classified synchronously during this call
    Computed,
    /// Skipped by the idle gate or handed to the background worker; buckets are empty
    NotYetAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpView {
    pub buckets: FollowUpBuckets,
    pub availability: Availability,
}

impl FollowUpView {
    fn not_yet_available() -> Self {
        Self {
            buckets: FollowUpBuckets::new(),
            availability: Availability::NotYetAvailable,
        }
    }
}

/// Bounds on how often the overlay is checked for expired entries.
const SWEEP_MIN: Duration = Duration::from_millis(10);
const SWEEP_MAX: Duration = Duration::from_secs(1);

/// State reachable from background tasks.
struct Shared {
    user_id: String,
    persisted_ttl: Duration,
    lookup: ActivityLookup,
    activities: Mutex<ActivityStore>,
    overlay: Mutex<OptimisticOverlay>,
    cache: CalculationCache,
    idle_gate: IdleGate,
    persisted: Option<PersistedCache>,
    pending_jobs: Mutex<HashSet<CacheKey>>,
    event_tx: Sender<CoreEvent>,
}

impl Shared {
    fn emit(&self, event: CoreEvent) {
        // The UI may have dropped its receiver; background work carries on regardless.
        let _ = self.event_tx.send(event);
    }

    /// Activity data changed: drop every cached result, in memory and on disk.
    fn data_changed(&self) {
        let version = self.cache.mark_data_changed();
        if let Some(persisted) = &self.persisted {
            if let Err(e) = persisted.invalidate_user(&self.user_id) {
                warn!("Failed to invalidate persisted cache: {}", e);
            }
        }
        debug!(version, "calculation cache invalidated");
    }

    fn persist_result(&self, key: &CacheKey, buckets: &FollowUpBuckets) {
        let Some(persisted) = &self.persisted else {
            return;
        };
        let ttl = chrono::Duration::from_std(self.persisted_ttl).unwrap_or(chrono::Duration::days(1));
        if let Err(e) = persisted.save(&self.user_id, key, buckets, Utc::now() + ttl) {
            warn!(key = %key, "Failed to persist calculation result: {}", e);
        }
    }

    /// Store a finished calculation for `key` unless activity data changed since
    /// `version`. Contacts whose optimistic entry differs from `overlay_at_start` were
    /// recorded while the calculation ran and are removed from `buckets` first, the
    /// same patch `record_activity` applies to cached entries. Returns whether the
    /// result was stored.
    fn store_result(
        &self,
        key: &CacheKey,
        buckets: &mut FollowUpBuckets,
        overlay_at_start: &OverlaySnapshot,
        version: u64,
    ) -> bool {
        // Held until the result is stored: a later record_activity patches it instead.
        let overlay = self.overlay.lock();
        for (contact_id, latest) in overlay.snapshot() {
            if overlay_at_start.get(&contact_id) != Some(&latest)
                && buckets.remove(&contact_id, None).is_some()
            {
                debug!(key = %key, contact_id = %contact_id, "optimistic activity recorded during calculation");
            }
        }
        let stored = self
            .cache
            .set_if_version(key.clone(), buckets.clone(), Instant::now(), version);
        drop(overlay);

        if stored {
            self.persist_result(key, buckets);
        }
        stored
    }

    /// Full lookup for `contact_ids`. Returns whether the result was applied.
    async fn refresh(&self, ticket: LookupTicket, contact_ids: Vec<ContactId>) -> bool {
        let outcome = self.lookup.fetch(&contact_ids).await;

        if !self.lookup.is_current(ticket) {
            debug!(
                generation = ticket.generation(),
                "activity lookup superseded, result discarded"
            );
            return false;
        }

        if outcome.is_total_failure() {
            // Keep whatever was known before rather than wiping it with nothing.
            self.emit(CoreEvent::ActivityLookupFailed {
                message: format!(
                    "all {} activity lookup batches failed",
                    outcome.total_batches
                ),
            });
            return false;
        }

        let failed_batches = outcome.failed_batches;
        let applied = self
            .activities
            .lock()
            .apply(&self.lookup, ticket, outcome);
        if applied {
            self.data_changed();
            info!(
                generation = ticket.generation(),
                contacts = contact_ids.len(),
                failed_batches,
                "activity data refreshed"
            );
            self.emit(CoreEvent::ActivitiesRefreshed {
                generation: ticket.generation(),
                contacts: contact_ids.len(),
                failed_batches,
            });
        }
        applied
    }

    async fn sync_activity(&self, activity: OptimisticActivity, grace: Duration) {
        let record = activity.to_record();
        let backend = self.lookup.backend();

        if let Err(e) = backend.persist_activity(&record).await {
            warn!(
                contact_id = %activity.contact_id,
                local_id = %activity.local_id,
                "Failed to persist activity: {}",
                e
            );
            self.overlay.lock().mark_failed(activity.local_id);
            self.emit(CoreEvent::ActivitySyncFailed {
                local_id: activity.local_id,
                contact_id: activity.contact_id.clone(),
                message: e.to_string(),
            });
            return;
        }

        self.overlay.lock().mark_succeeded(activity.local_id);

        let contact_ids = vec![activity.contact_id.clone()];
        let outcome = self.lookup.fetch(&contact_ids).await;
        {
            let mut store = self.activities.lock();
            store.merge(&outcome.activities);
            store.record_confirmed(&activity.contact_id, ActivitySummary::at(record.timestamp));
        }
        self.data_changed();
        debug!(contact_id = %activity.contact_id, "activity confirmed");
        self.emit(CoreEvent::ActivitySynced {
            local_id: activity.local_id,
            contact_id: activity.contact_id.clone(),
        });

        // Keep the entry a moment longer so a read racing the refresh still sees it.
        tokio::time::sleep(grace).await;
        let retired = self.overlay.lock().remove(activity.local_id);
        if retired.is_some() {
            debug!(local_id = %activity.local_id, "optimistic entry retired");
        }
    }

    /// Drop overlay entries older than `timeout`. Returns how many expired.
    fn expire_overlay(&self, timeout: Duration) -> usize {
        let expired = self.overlay.lock().expire(Utc::now(), timeout);
        if expired.is_empty() {
            return 0;
        }
        if expired.iter().any(|a| a.status != SyncStatus::Succeeded) {
            // Never confirmed: cached buckets still hide these contacts.
            self.data_changed();
        }
        let count = expired.len();
        for activity in expired {
            info!(
                contact_id = %activity.contact_id,
                status = ?activity.status,
                "optimistic activity expired"
            );
            self.emit(CoreEvent::OptimisticExpired {
                local_id: activity.local_id,
                contact_id: activity.contact_id,
            });
        }
        count
    }

    async fn sweep_overlay(self: Arc<Self>, timeout: Duration) {
        let every = (timeout / 4).clamp(SWEEP_MIN, SWEEP_MAX);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.expire_overlay(timeout);
        }
    }
}

/// Owns the follow-up pipeline: activity lookup, optimistic overlay, calculation cache
/// and background scheduler. Methods are synchronous; background outcomes arrive as
/// [`CoreEvent`]s on the receiver from [`take_event_rx`](Self::take_event_rx).
pub struct FollowUpRuntime {
    config: FollowUpConfig,
    rt: tokio::runtime::Runtime,
    shared: Arc<Shared>,
    contacts: RwLock<Vec<Contact>>,
    scheduler: CalculationScheduler,
    event_rx: Mutex<Option<Receiver<CoreEvent>>>,
}

impl FollowUpRuntime {
    pub fn new(config: FollowUpConfig, backend: Arc<dyn ActivityBackend>) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("followup-rt")
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;

        let persisted = if config.persist_cache {
            let db = Database::new(&config.data_dir).with_context(|| {
                format!(
                    "Failed to open calculation cache in {}",
                    config.data_dir.display()
                )
            })?;
            Some(PersistedCache::new(Arc::new(db)))
        } else {
            None
        };

        let scheduler = CalculationScheduler::spawn(config.progress_every)
            .context("Failed to start calculation worker")?;

        let (event_tx, event_rx) = mpsc::channel::<CoreEvent>();

        let shared = Arc::new(Shared {
            user_id: config.user_id.clone(),
            persisted_ttl: config.persisted_cache_ttl(),
            lookup: ActivityLookup::new(backend, config.lookup_batch_size),
            activities: Mutex::new(ActivityStore::new()),
            overlay: Mutex::new(OptimisticOverlay::new()),
            cache: CalculationCache::new(config.cache_ttl()),
            idle_gate: IdleGate::new(config.idle_interval()),
            persisted,
            pending_jobs: Mutex::new(HashSet::new()),
            event_tx,
        });

        rt.spawn(shared.clone().sweep_overlay(config.optimistic_timeout()));

        info!(
            user_id = %config.user_id,
            persist_cache = config.persist_cache,
            "follow-up runtime started"
        );

        Ok(Self {
            config,
            rt,
            shared,
            contacts: RwLock::new(Vec::new()),
            scheduler,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn config(&self) -> &FollowUpConfig {
        &self.config
    }

    pub fn take_event_rx(&mut self) -> Option<Receiver<CoreEvent>> {
        self.event_rx.get_mut().take()
    }

    // ===== Contacts =====

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().clone()
    }

    /// Replace the contact list. Cached results are dropped only if a previously loaded
    /// list actually changed; the first load keeps persisted results usable.
    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        let changed = {
            let mut current = self.contacts.write();
            let first_load = current.is_empty();
            if *current == contacts {
                false
            } else {
                *current = contacts;
                !first_load
            }
        };
        if changed {
            self.shared.data_changed();
        }
    }

    fn contact_ids(&self) -> Vec<ContactId> {
        self.contacts.read().iter().map(|c| c.id.clone()).collect()
    }

    // ===== Activity lookup =====

    /// Start a full activity lookup in the background. Completion is reported as
    /// `ActivitiesRefreshed` or `ActivityLookupFailed`; a result overtaken by a later
    /// refresh is dropped silently.
    pub fn refresh_activities(&self) -> LookupTicket {
        let ticket = self.shared.lookup.begin();
        let contact_ids = self.contact_ids();
        let shared = self.shared.clone();
        self.rt.spawn(async move {
            shared.refresh(ticket, contact_ids).await;
        });
        ticket
    }

    /// Like [`refresh_activities`](Self::refresh_activities) but waits for the result.
    /// Must not be called from inside an async context.
    pub fn refresh_activities_blocking(&self) -> bool {
        let ticket = self.shared.lookup.begin();
        let contact_ids = self.contact_ids();
        self.rt.block_on(self.shared.refresh(ticket, contact_ids))
    }

    pub fn activity_for(&self, contact_id: &str) -> Option<ActivitySummary> {
        self.shared.activities.lock().get(contact_id).copied()
    }

    // ===== Optimistic activity =====

    /// Record an activity the user just performed. The contact leaves every cached
    /// bucket before this returns, including results still being calculated; the
    /// backend write happens in the background. Entries older than the optimistic
    /// timeout are swept out of the overlay whatever their status.
    pub fn record_activity(
        &self,
        contact_id: impl Into<ContactId>,
        descriptor: ActivityDescriptor,
    ) -> OptimisticActivity {
        let activity = self
            .shared
            .overlay
            .lock()
            .record(contact_id, descriptor, Utc::now());
        let patched = self.shared.cache.patch_contact_everywhere(&activity.contact_id);
        debug!(
            contact_id = %activity.contact_id,
            local_id = %activity.local_id,
            patched,
            "optimistic activity recorded"
        );

        let shared = self.shared.clone();
        let pending = activity.clone();
        let grace = self.config.optimistic_grace();
        self.rt.spawn(async move {
            shared.sync_activity(pending, grace).await;
        });

        activity
    }

    pub fn overlay_entries(&self) -> Vec<OptimisticActivity> {
        self.shared.overlay.lock().all()
    }

    // ===== Calculation =====

    /// Follow-up buckets for the current contacts under `labels`.
    ///
    /// Order of preference: in-memory cache, persisted cache, the idle gate, then
    /// computation (synchronous for small sets, background worker for large ones).
    /// `force` skips both caches and the idle gate.
    pub fn follow_up_buckets(&self, labels: &LabelFilter, force: bool) -> FollowUpView {
        let contacts = self.contacts();
        let contact_ids: Vec<ContactId> = contacts.iter().map(|c| c.id.clone()).collect();
        let key = CacheKey::for_filter(&contact_ids, labels);
        let now = Instant::now();

        if !force {
            if let Some(buckets) = self.shared.cache.get(&key, now) {
                debug!(key = %key, "calculation cache hit");
                return FollowUpView {
                    buckets,
                    availability: Availability::Cached,
                };
            }
            if let Some(buckets) = self.load_persisted(&key) {
                let version = self.shared.cache.data_version();
                self.shared
                    .cache
                    .set_if_version(key, buckets.clone(), now, version);
                return FollowUpView {
                    buckets,
                    availability: Availability::Cached,
                };
            }
        }

        if !self.shared.idle_gate.should_compute(now, force) {
            debug!(key = %key, "recomputation skipped, system not idle yet");
            return FollowUpView::not_yet_available();
        }

        let version = self.shared.cache.data_version();
        let payload = self.payload(contacts, labels);

        if payload.contacts.len() >= self.config.background_threshold {
            self.spawn_background(key, payload, version);
            return FollowUpView::not_yet_available();
        }

        let mut buckets =
            calculate(&payload, self.config.progress_every, &mut |_: usize, _: usize| {});
        if !self
            .shared
            .store_result(&key, &mut buckets, &payload.overlay, version)
        {
            debug!(key = %key, "data changed during calculation, result not cached");
        }
        self.shared.idle_gate.mark_computed(Instant::now());

        FollowUpView {
            buckets,
            availability: Availability::Computed,
        }
    }

    fn load_persisted(&self, key: &CacheKey) -> Option<FollowUpBuckets> {
        let persisted = self.shared.persisted.as_ref()?;
        // Stored rows know nothing about activities that are still optimistic.
        if !self.shared.overlay.lock().is_empty() {
            return None;
        }
        let buckets = persisted.load(&self.shared.user_id, key, Utc::now())?;
        debug!(key = %key, "persisted cache hit");
        Some(buckets)
    }

    fn payload(&self, contacts: Vec<Contact>, labels: &LabelFilter) -> CalculationPayload {
        CalculationPayload {
            contacts,
            label_filter: labels.clone(),
            activities: self.shared.activities.lock().activities().clone(),
            overlay: self.shared.overlay.lock().snapshot(),
            now: Utc::now(),
            missing_creation: self.config.missing_creation_policy,
        }
    }

    fn spawn_background(&self, key: CacheKey, payload: CalculationPayload, version: u64) {
        if !self.shared.pending_jobs.lock().insert(key.clone()) {
            debug!(key = %key, "background calculation already running");
            return;
        }

        let total = payload.contacts.len();
        let overlay_at_start = payload.overlay.clone();
        let (update_tx, mut update_rx) = unbounded_channel();
        let job_id = match self.scheduler.submit(payload, update_tx) {
            Ok(job_id) => job_id,
            Err(e) => {
                self.shared.pending_jobs.lock().remove(&key);
                error!("Failed to submit background calculation: {}", e);
                self.shared.emit(CoreEvent::CalculationFailed {
                    job_id: 0,
                    message: e.to_string(),
                });
                return;
            }
        };
        info!(job_id, total, key = %key, "background calculation submitted");

        let shared = self.shared.clone();
        self.rt.spawn(async move {
            while let Some(update) = update_rx.recv().await {
                match update {
                    SchedulerUpdate::Progress {
                        job_id,
                        processed,
                        total,
                    } => shared.emit(CoreEvent::CalculationProgress {
                        job_id,
                        processed,
                        total,
                    }),
                    SchedulerUpdate::Completed {
                        job_id,
                        mut buckets,
                    } => {
                        if shared.store_result(&key, &mut buckets, &overlay_at_start, version) {
                            shared.idle_gate.mark_computed(Instant::now());
                        } else {
                            debug!(job_id, "data changed during background calculation, result dropped");
                        }
                        shared.emit(CoreEvent::CalculationCompleted { job_id });
                        break;
                    }
                    SchedulerUpdate::Failed { job_id, error } => {
                        warn!(job_id, "background calculation failed: {}", error);
                        shared.emit(CoreEvent::CalculationFailed {
                            job_id,
                            message: error.to_string(),
                        });
                        break;
                    }
                }
            }
            shared.pending_jobs.lock().remove(&key);
        });
    }

    /// Drop every cached result, in memory and on disk.
    pub fn invalidate_cache(&self) {
        self.shared.data_changed();
    }

    pub fn shutdown(self) {
        let Self {
            rt, mut scheduler, ..
        } = self;
        scheduler.shutdown();
        rt.shutdown_timeout(Duration::from_secs(1));
        info!("follow-up runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::BackendError;
    use crate::models::{ActivityKind, ActivityMap, ActivityRecord, StalenessBucket};
    use chrono::Duration as ChronoDuration;
    use futures::future::BoxFuture;

    /// Answers lookups from memory; writes never complete.
    struct StalledBackend(MemoryBackend);

    impl ActivityBackend for StalledBackend {
        fn fetch_activities<'a>(
            &'a self,
            contact_ids: &'a [ContactId],
        ) -> BoxFuture<'a, Result<ActivityMap, BackendError>> {
            self.0.fetch_activities(contact_ids)
        }

        fn persist_activity<'a>(
            &'a self,
            _activity: &'a ActivityRecord,
        ) -> BoxFuture<'a, Result<(), BackendError>> {
            Box::pin(futures::future::pending())
        }
    }

    fn config() -> FollowUpConfig {
        FollowUpConfig {
            persist_cache: false,
            idle_interval_ms: 60_000,
            ..FollowUpConfig::default()
        }
    }

    fn stale_runtime() -> FollowUpRuntime {
        let now = Utc::now();
        let backend = MemoryBackend::with_records(vec![ActivityRecord {
            contact_id: "a".to_string(),
            kind: ActivityKind::Call,
            details: None,
            timestamp: now - ChronoDuration::days(8),
        }]);
        let runtime =
            FollowUpRuntime::new(config(), Arc::new(StalledBackend(backend))).unwrap();
        runtime.set_contacts(vec![
            Contact::new("a").created_at(now - ChronoDuration::days(60)),
            Contact::new("b").created_at(now - ChronoDuration::days(60)),
        ]);
        assert!(runtime.refresh_activities_blocking());
        runtime
    }

    #[test]
    fn test_second_read_is_cached() {
        let runtime = stale_runtime();
        let filter = LabelFilter::default();

        let first = runtime.follow_up_buckets(&filter, false);
        assert_eq!(first.availability, Availability::Computed);
        assert_eq!(first.buckets.bucket_of("a"), Some(StalenessBucket::Stale7Days));
        assert_eq!(first.buckets.bucket_of("b"), Some(StalenessBucket::NeedsApproach));

        let second = runtime.follow_up_buckets(&filter, false);
        assert_eq!(second.availability, Availability::Cached);
        assert_eq!(second.buckets, first.buckets);
    }

    #[test]
    fn test_idle_gate_returns_empty_buckets() {
        let runtime = stale_runtime();
        let filter = LabelFilter::default();
        runtime.follow_up_buckets(&filter, false);

        // Different filter misses the cache; the gate refuses to recompute so soon.
        let other = LabelFilter::new(["vip"]);
        let view = runtime.follow_up_buckets(&other, false);
        assert_eq!(view.availability, Availability::NotYetAvailable);
        assert!(view.buckets.is_empty());

        let forced = runtime.follow_up_buckets(&other, true);
        assert_eq!(forced.availability, Availability::Computed);
    }

    #[test]
    fn test_record_activity_patches_cache_immediately() {
        let runtime = stale_runtime();
        let filter = LabelFilter::default();
        runtime.follow_up_buckets(&filter, false);

        runtime.record_activity("a", ActivityDescriptor::new(ActivityKind::Email));

        let view = runtime.follow_up_buckets(&filter, false);
        assert_eq!(view.availability, Availability::Cached);
        assert_eq!(view.buckets.bucket_of("a"), None);
        let entries = runtime.overlay_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, SyncStatus::Pending);
    }

    #[test]
    fn test_result_computed_before_record_is_patched() {
        let runtime = stale_runtime();
        let filter = LabelFilter::default();
        let key = CacheKey::for_filter(&runtime.contact_ids(), &filter);
        let version = runtime.shared.cache.data_version();
        let payload = runtime.payload(runtime.contacts(), &filter);
        let mut buckets = calculate(&payload, 100, &mut |_: usize, _: usize| {});
        assert_eq!(buckets.bucket_of("a"), Some(StalenessBucket::Stale7Days));

        // Recorded after the snapshot, before the result is stored.
        runtime.record_activity("a", ActivityDescriptor::new(ActivityKind::Email));

        assert!(runtime
            .shared
            .store_result(&key, &mut buckets, &payload.overlay, version));
        assert_eq!(buckets.bucket_of("a"), None);
        assert_eq!(buckets.bucket_of("b"), Some(StalenessBucket::NeedsApproach));

        let view = runtime.follow_up_buckets(&filter, false);
        assert_eq!(view.availability, Availability::Cached);
        assert_eq!(view.buckets.bucket_of("a"), None);
    }

    #[test]
    fn test_overlay_sweep_expires_old_entries() {
        let mut runtime = stale_runtime();
        let rx = runtime.take_event_rx().unwrap();
        runtime.follow_up_buckets(&LabelFilter::default(), false);
        let activity = runtime.record_activity("a", ActivityDescriptor::new(ActivityKind::Email));

        assert_eq!(runtime.shared.expire_overlay(Duration::from_secs(60)), 0);
        assert_eq!(runtime.overlay_entries().len(), 1);

        assert_eq!(runtime.shared.expire_overlay(Duration::ZERO), 1);
        assert!(runtime.overlay_entries().is_empty());
        // Never confirmed, so the patched result goes too.
        assert!(runtime.shared.cache.is_empty());
        let expired = rx.try_iter().find_map(|e| match e {
            CoreEvent::OptimisticExpired { local_id, .. } => Some(local_id),
            _ => None,
        });
        assert_eq!(expired, Some(activity.local_id));
    }

    #[test]
    fn test_set_same_contacts_keeps_cache() {
        let runtime = stale_runtime();
        let filter = LabelFilter::default();
        runtime.follow_up_buckets(&filter, false);

        runtime.set_contacts(runtime.contacts());
        let view = runtime.follow_up_buckets(&filter, false);
        assert_eq!(view.availability, Availability::Cached);
    }
}
