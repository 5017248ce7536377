//! Error taxonomy shared by every stream pipeline
//!
//! A fatal condition inside a pipeline is a [`PipelineError`] tagged with the
//! [`Stage`] it originated from. Before it leaves the worker it is turned into an
//! [`ErrorRecord`] keyed by the stream identity and delivered like a frame.

use crate::pipeline::types::StreamId;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Pipeline stage where an error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Opening the source, probing stream info, opening the codec
    Open,
    /// Reading packets from the container
    Demux,
    /// Sending packets to or receiving frames from the decoder
    Decode,
    /// Color/scale conversion
    Convert,
    /// Buffer allocation and worker resources
    Resource,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Open => "open",
            Stage::Demux => "demux",
            Stage::Decode => "decode",
            Stage::Convert => "convert",
            Stage::Resource => "resource",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal error of a single pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} error: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub message: String,
}

impl PipelineError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn open(message: impl ToString) -> Self {
        Self::new(Stage::Open, message.to_string())
    }

    pub fn demux(message: impl ToString) -> Self {
        Self::new(Stage::Demux, message.to_string())
    }

    pub fn decode(message: impl ToString) -> Self {
        Self::new(Stage::Decode, message.to_string())
    }

    pub fn convert(message: impl ToString) -> Self {
        Self::new(Stage::Convert, message.to_string())
    }

    pub fn resource(message: impl ToString) -> Self {
        Self::new(Stage::Resource, message.to_string())
    }
}

/// Error surfaced to the consumer, once, for one stream
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub stream: StreamId,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Local>,
}

impl ErrorRecord {
    pub fn new(stream: StreamId, error: &PipelineError) -> Self {
        Self {
            stream,
            stage: error.stage,
            message: error.message.clone(),
            at: Local::now(),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] stream {} {} error: {}",
            self.at.format("%H:%M:%S"),
            self.stream,
            self.stage,
            self.message
        )
    }
}
