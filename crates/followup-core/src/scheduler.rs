//! Background calculation worker.
//!
//! Large contact sets are classified on a dedicated thread so the caller never
//! blocks. The worker receives an owned payload over a command channel and reports
//! back over a per-job update channel; no state is shared with the caller.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::classifier::{classify_all_with_progress, ClassifyContext, MissingCreationPolicy};
use crate::error::SchedulerError;
use crate::models::{ActivityMap, Contact, FollowUpBuckets, LabelFilter};
use crate::overlay::OverlaySnapshot;

/// Everything a background calculation needs, owned.
#[derive(Debug, Clone)]
pub struct CalculationPayload {
    pub contacts: Vec<Contact>,
    pub label_filter: LabelFilter,
    pub activities: ActivityMap,
    pub overlay: OverlaySnapshot,
    pub now: DateTime<Utc>,
    pub missing_creation: MissingCreationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerUpdate {
    Progress {
        job_id: u64,
        processed: usize,
        total: usize,
    },
    Completed {
        job_id: u64,
        buckets: FollowUpBuckets,
    },
    Failed {
        job_id: u64,
        error: SchedulerError,
    },
}

pub enum SchedulerCommand {
    Calculate {
        job_id: u64,
        payload: CalculationPayload,
        update_tx: UnboundedSender<SchedulerUpdate>,
    },
    Shutdown,
}

/// The calculation run for each job. Swappable so failure handling can be exercised.
pub type CalculateFn =
    fn(&CalculationPayload, usize, &mut dyn FnMut(usize, usize)) -> FollowUpBuckets;

pub fn calculate(
    payload: &CalculationPayload,
    progress_every: usize,
    on_progress: &mut dyn FnMut(usize, usize),
) -> FollowUpBuckets {
    let ctx = ClassifyContext::new(&payload.label_filter, payload.now)
        .with_policy(payload.missing_creation);
    classify_all_with_progress(
        &payload.contacts,
        &payload.activities,
        &payload.overlay,
        &ctx,
        progress_every,
        on_progress,
    )
}

struct CalculationWorker {
    command_rx: Receiver<SchedulerCommand>,
    progress_every: usize,
    calculate: CalculateFn,
}

impl CalculationWorker {
    fn run(self) {
        debug!("calculation worker started");
        while let Ok(command) = self.command_rx.recv() {
            match command {
                SchedulerCommand::Calculate {
                    job_id,
                    payload,
                    update_tx,
                } => self.handle_calculate(job_id, payload, update_tx),
                SchedulerCommand::Shutdown => break,
            }
        }
        debug!("calculation worker stopped");
    }

    fn handle_calculate(
        &self,
        job_id: u64,
        payload: CalculationPayload,
        update_tx: UnboundedSender<SchedulerUpdate>,
    ) {
        let total = payload.contacts.len();
        debug!(job_id, total, "background calculation started");

        let progress_tx = update_tx.clone();
        let mut on_progress = move |processed: usize, total: usize| {
            let _ = progress_tx.send(SchedulerUpdate::Progress {
                job_id,
                processed,
                total,
            });
        };
        let calculate = self.calculate;
        let progress_every = self.progress_every;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            calculate(&payload, progress_every, &mut on_progress)
        }));

        let update = match result {
            Ok(buckets) => SchedulerUpdate::Completed { job_id, buckets },
            Err(panic_payload) => {
                let message = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id, "background calculation panicked: {}", message);
                SchedulerUpdate::Failed {
                    job_id,
                    error: SchedulerError::Panicked(message),
                }
            }
        };
        let _ = update_tx.send(update);
    }
}

pub struct CalculationScheduler {
    command_tx: Sender<SchedulerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    next_job: AtomicU64,
}

impl CalculationScheduler {
    pub fn spawn(progress_every: usize) -> Result<Self, SchedulerError> {
        Self::spawn_with(progress_every, calculate)
    }

    pub fn spawn_with(progress_every: usize, calculate: CalculateFn) -> Result<Self, SchedulerError> {
        let (command_tx, command_rx) = mpsc::channel::<SchedulerCommand>();
        let worker = CalculationWorker {
            command_rx,
            progress_every: progress_every.max(1),
            calculate,
        };
        let worker_handle = std::thread::Builder::new()
            .name("followup-calc".to_string())
            .spawn(move || worker.run())
            .map_err(|_| SchedulerError::Disconnected)?;

        Ok(Self {
            command_tx,
            worker_handle: Some(worker_handle),
            next_job: AtomicU64::new(1),
        })
    }

    /// Queue a calculation. Updates for the returned job id arrive on `update_tx`.
    pub fn submit(
        &self,
        payload: CalculationPayload,
        update_tx: UnboundedSender<SchedulerUpdate>,
    ) -> Result<u64, SchedulerError> {
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst);
        self.command_tx
            .send(SchedulerCommand::Calculate {
                job_id,
                payload,
                update_tx,
            })
            .map_err(|_| SchedulerError::Disconnected)?;
        Ok(job_id)
    }

    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(SchedulerCommand::Shutdown);
        if let Some(worker_handle) = self.worker_handle.take() {
            let _ = worker_handle.join();
            info!("calculation worker joined");
        }
    }
}

impl Drop for CalculationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
