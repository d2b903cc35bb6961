//! Error types for the BSP engine
//!
//! Every error aborts the run. The engine performs no retries; a driver that
//! wants them re-runs the whole program from `load_state`.

use thiserror::Error;

use crate::pipeline::StepId;
use crate::value::VertexId;

/// Errors that can occur while configuring or running a vertex program
#[derive(Debug, Error)]
pub enum BspError {
    /// Bad or missing pipeline, key declaration or program configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Access to a memory or vertex key that was never declared
    #[error("unknown compute key '{key}'")]
    UnknownKey { key: String },

    /// A worker read a memory key that is only visible to the master
    #[error("memory key '{key}' is not broadcast to workers")]
    KeyNotBroadcast { key: String },

    /// A position id did not resolve in the pipeline's position index
    #[error("step '{step_id}' does not resolve in pipeline '{pipeline}'")]
    UnresolvedStep { step_id: StepId, pipeline: String },

    /// A merge operator is not order independent or was applied to the wrong types
    #[error("merge contract violated for key '{key}': {reason}")]
    MergeContractViolation { key: String, reason: String },

    /// Traverser bulk must always be at least one
    #[error("invalid bulk {0}: bulk must be at least 1")]
    InvalidBulk(u64),

    /// Merging would push a bulk total past `u64::MAX`
    #[error("bulk overflow: cannot add {added} to {current}")]
    BulkOverflow { current: u64, added: u64 },

    /// A vertex failed during `execute`; fatal to the whole superstep
    #[error("vertex {vertex_id} failed in superstep {superstep}: {message}")]
    VertexExecution {
        superstep: usize,
        vertex_id: VertexId,
        message: String,
        #[source]
        source: Option<Box<BspError>>,
    },

    /// A program lifecycle transition was requested out of order
    #[error("illegal program transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    /// The driver's superstep cap was hit before `terminate` returned true
    #[error("program did not terminate within {limit} supersteps")]
    MaxSuperstepsExceeded { limit: usize },

    /// A worker task panicked or was cancelled
    #[error("worker {worker} failed in superstep {superstep}: {message}")]
    WorkerPanicked {
        superstep: usize,
        worker: usize,
        message: String,
    },

    /// Checkpoint persistence failed
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BspError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn unknown_key(key: impl Into<String>) -> Self {
        Self::UnknownKey { key: key.into() }
    }

    pub fn merge_violation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MergeContractViolation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a failure raised while executing `vertex_id` in `superstep`
    pub fn vertex_error(superstep: usize, vertex_id: VertexId, source: BspError) -> Self {
        // Already attributed errors keep their original location
        if let BspError::VertexExecution { .. } = source {
            return source;
        }
        Self::VertexExecution {
            superstep,
            vertex_id,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// The superstep this error is attributed to, when known
    pub fn superstep(&self) -> Option<usize> {
        match self {
            BspError::VertexExecution { superstep, .. }
            | BspError::WorkerPanicked { superstep, .. } => Some(*superstep),
            _ => None,
        }
    }

    /// The vertex this error is attributed to, when known
    pub fn vertex_id(&self) -> Option<VertexId> {
        match self {
            BspError::VertexExecution { vertex_id, .. } => Some(*vertex_id),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for BspError {
    fn from(err: serde_yaml::Error) -> Self {
        BspError::Configuration(format!("invalid yaml: {err}"))
    }
}
