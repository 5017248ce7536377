//! Concurrent multi-camera decode pipelines with latest-frame delivery

pub mod assets;
pub mod config;
pub mod convert;
pub mod delivery;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod utils;

pub use config::Config;
pub use delivery::{DeliveryEvent, Dispatcher, FrameConsumer};
pub use error::{ErrorRecord, PipelineError, Stage};
pub use pipeline::{ConvertedFrame, PipelineState, StreamId, Supervisor};
