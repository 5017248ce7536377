//! Stream decode pipelines
//!
//! Each pipeline runs one source on a dedicated worker thread:
//! - State: validated lifecycle shared by the handle and the worker
//! - Worker: open with retry, demux, decode, convert, publish
//! - Health: per-stream counters and periodic alerting
//! - Supervisor: session start/stop over many pipelines

pub mod health;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod types;
mod worker;

pub use health::{HealthAlert, HealthMonitor, HealthSummary, StreamHealth};
pub use state::{PipelineState, SharedState};
pub use stream::StreamPipeline;
pub use supervisor::{Registry, SessionError, Slot, StreamReport, Supervisor};
pub use types::{ConvertedFrame, StreamId};
pub use worker::WorkerExit;
