pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;

pub use config::AppConfig;
pub use crate::core::{PipelineOrchestrator, RunOptions};
pub use domain::model::{Outcome, Record, RunSummary};
pub use domain::ports::Dispatcher;
pub use utils::error::{EtlError, Result};
