pub mod cache;
pub mod db;
pub mod state_cache;

pub use cache::{CacheKey, CalculationCache, IdleGate};
pub use db::Database;
pub use state_cache::{PersistedCache, CACHE_METADATA_VERSION};
