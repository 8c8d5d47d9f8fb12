//! Typed error hierarchy for the OmniGen control plane.
//!
//! - `JobError`: rejections and failures of the job controller
//! - `WorkerError`: failures of the worker process boundary

use thiserror::Error;

/// Errors from the worker boundary (spawning and signalling the generator).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker did not expose a piped {stream}")]
    MissingPipe { stream: &'static str },

    #[error("Failed to signal worker pid {pid}: {message}")]
    SignalFailed { pid: u32, message: String },
}

/// Errors from the job controller.
///
/// Every variant is terminal to the request that produced it, never to a
/// running job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Generation already in progress")]
    JobAlreadyRunning,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Job state lock poisoned")]
    LockPoisoned,
}
