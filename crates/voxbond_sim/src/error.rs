//! # Simulation Error Types

use std::path::PathBuf;

use thiserror::Error;
use voxbond_core::GroupError;

/// Errors that stop a simulation step or run.
#[derive(Error, Debug)]
pub enum SimError {
    /// A group could not be kept consistent. The lattice is unusable.
    #[error("fatal group error: {0}")]
    Fatal(#[from] GroupError),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A step worker panicked.
    #[error("step worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, SimError>;
