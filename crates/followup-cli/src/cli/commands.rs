use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use followup_core::models::LabelFilter;
use followup_core::store::{Database, PersistedCache};
use followup_core::{
    ActivityBackend, Availability, CoreEvent, FollowUpConfig, FollowUpRuntime, HttpBackend,
    MemoryBackend,
};

use crate::cli::input::load_contacts;
use crate::cli::output::ClassifyOutput;

/// How long `classify` waits for a background calculation before giving up.
const BACKGROUND_WAIT: Duration = Duration::from_secs(120);

pub enum ActivitySource {
    File(PathBuf),
    Remote { url: String, api_key: Option<String> },
}

impl ActivitySource {
    fn backend(&self) -> Result<Arc<dyn ActivityBackend>> {
        match self {
            ActivitySource::File(path) => Ok(Arc::new(MemoryBackend::from_json_file(path)?)),
            ActivitySource::Remote { url, api_key } => {
                Ok(Arc::new(HttpBackend::new(url.clone(), api_key.clone())))
            }
        }
    }
}

pub struct ClassifyRequest {
    pub contacts: PathBuf,
    pub activities: ActivitySource,
    pub labels: Vec<String>,
    pub force: bool,
}

/// Config from `path`, or defaults rooted in the platform data directory.
pub fn load_config(path: Option<&Path>) -> Result<FollowUpConfig> {
    match path {
        Some(path) => FollowUpConfig::load(path),
        None => {
            let data_dir = dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("followup");
            Ok(FollowUpConfig::new(data_dir))
        }
    }
}

pub fn run_classify(request: ClassifyRequest, config: FollowUpConfig) -> Result<ClassifyOutput> {
    let contacts = load_contacts(&request.contacts)?;
    let backend = request.activities.backend()?;
    let filter = LabelFilter::new(request.labels);

    let mut runtime =
        FollowUpRuntime::new(config, backend).context("Failed to start follow-up runtime")?;
    let events = runtime
        .take_event_rx()
        .context("Event receiver already taken")?;

    runtime.set_contacts(contacts);
    if !runtime.refresh_activities_blocking() {
        eprintln!("Warning: activity lookup failed, classifying without activity data");
    }

    let mut view = runtime.follow_up_buckets(&filter, request.force);
    if view.availability == Availability::NotYetAvailable {
        wait_for_background(&events)?;
        view = runtime.follow_up_buckets(&filter, false);
    }
    runtime.shutdown();

    Ok(ClassifyOutput::from(view))
}

fn wait_for_background(events: &Receiver<CoreEvent>) -> Result<()> {
    loop {
        match events.recv_timeout(BACKGROUND_WAIT) {
            Ok(CoreEvent::CalculationProgress {
                processed, total, ..
            }) => eprintln!("classified {}/{}", processed, total),
            Ok(CoreEvent::CalculationCompleted { .. }) => return Ok(()),
            Ok(CoreEvent::CalculationFailed { message, .. }) => {
                bail!("Background calculation failed: {}", message)
            }
            Ok(_) => continue,
            Err(e) => bail!("No calculation result: {}", e),
        }
    }
}

/// Remove expired persisted rows. Returns how many were removed.
pub fn run_purge(config: &FollowUpConfig) -> Result<usize> {
    let db = Database::new(&config.data_dir).with_context(|| {
        format!(
            "Failed to open calculation cache in {}",
            config.data_dir.display()
        )
    })?;
    let removed = PersistedCache::new(Arc::new(db))
        .purge_expired(Utc::now())
        .context("Failed to purge calculation cache")?;
    Ok(removed)
}
