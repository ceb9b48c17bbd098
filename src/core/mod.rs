pub mod checkpoint;
pub mod dispatch;
pub mod error_log;
pub mod filter;
pub mod formula;
pub mod mapper;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod source;
pub mod transforms;
pub mod validator;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use dispatch::{resolve_endpoint, DispatchClient, EndpointRouter};
pub use filter::RecordFilter;
pub use mapper::PayloadMapper;
pub use metrics::{MetricsRegistry, ProcessingMetrics};
pub use pipeline::{PipelineOrchestrator, PipelineState, RunOptions};
pub use rate_limiter::RateLimiter;
pub use source::RecordSource;
pub use validator::RecordValidator;
