//! CLI command implementations.

mod cache;
mod config;
mod run;
mod serve;

pub use cache::run_cache;
pub use config::run_config;
pub use run::{run_batch, RunOptions};
pub use serve::run_serve;
