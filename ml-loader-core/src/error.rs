//! Error types for ML data loaders

use std::io;
use thiserror::Error;

use crate::graph::StageId;

/// Result type for data loader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for data loader operations
#[derive(Error, Debug)]
pub enum Error {
    /// Misconfiguration detected while constructing a stage or loader
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The pipeline graph does not have the shape a stage requires
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A stage id that does not belong to the graph
    #[error("Unknown stage: {0}")]
    UnknownStage(StageId),

    /// The graph reachable from the root contains a cycle
    #[error("Cycle detected through stage {0}")]
    CycleDetected(StageId),

    /// An adjacency index was used after the graph it describes changed
    #[error("Stale adjacency index: built at revision {index}, graph is at revision {graph}")]
    StaleIndex {
        /// Revision the index was built from
        index: u64,
        /// Current graph revision
        graph: u64,
    },

    /// Error raised by a stage while producing items
    #[error("Stage error: {0}")]
    Stage(String),

    /// A worker died or raised while running its sub-pipeline
    #[error("Worker {worker} failed: {reason}")]
    WorkerFailure {
        /// Index of the failed worker
        worker: usize,
        /// Failure description
        reason: String,
    },

    /// An asynchronous operation (device copy) failed
    #[error("Asynchronous operation failed: {0}")]
    AsyncOperationFailure(String),

    /// A background thread failed outside of a stage error
    #[error("Background thread failed: {0}")]
    BackgroundFailure(String),

    /// The loader or stream was already closed
    #[error("Pipeline closed")]
    Closed,

    /// IO error while spawning threads or reading configuration
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a stage error from anything printable
    pub fn stage(message: impl Into<String>) -> Self {
        Error::Stage(message.into())
    }

    /// Whether this error leaves the pipeline unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WorkerFailure { .. } | Error::BackgroundFailure(_) | Error::Closed
        )
    }
}
