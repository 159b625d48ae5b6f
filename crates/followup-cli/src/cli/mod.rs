pub mod commands;
pub mod input;
pub mod output;

pub use commands::{load_config, run_classify, run_purge, ActivitySource, ClassifyRequest};
pub use input::load_contacts;
pub use output::ClassifyOutput;
