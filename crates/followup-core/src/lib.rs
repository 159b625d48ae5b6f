pub mod backend;
pub mod classifier;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod lookup;
pub mod models;
pub mod overlay;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tracing_setup;

pub use backend::{ActivityBackend, HttpBackend, MemoryBackend};
pub use classifier::{classify, classify_all, ClassifyContext, MissingCreationPolicy};
pub use config::FollowUpConfig;
pub use error::{BackendError, CacheStoreError, SchedulerError, ValidationError};
pub use events::CoreEvent;
pub use runtime::{Availability, FollowUpRuntime, FollowUpView};
pub use tracing_setup::init_tracing;
