//! Pipeline-specific error types.

use thiserror::Error;

/// Errors that can cross the orchestrator boundary.
///
/// Stage-local recoverable conditions never show up here; they are absorbed
/// by the stage module and only logged.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage {stage} error: {message}")]
    Stage { stage: String, message: String },

    #[error("Fatal error in stage {stage}: {message}")]
    Fatal { stage: String, message: String },

    #[error("Initialization failed after {frames} frames: {reason}")]
    InitializationFailed { frames: usize, reason: String },

    #[error("Pipeline is shut down")]
    ShutDown,

    #[error("Pipeline is paused")]
    Paused,

    #[error("Pipeline was terminated and cannot be resumed")]
    Terminated,

    #[error("Operation not available in {0} mode")]
    WrongMode(&'static str),

    #[error("Failed to spawn worker thread: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
