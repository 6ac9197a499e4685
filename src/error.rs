//! Error handling for the VIO pipeline crate
//!
//! This module defines the crate-level error type and a Result alias.
//! Errors raised inside the orchestration core live in
//! [`crate::pipeline::PipelineError`] and convert into [`VioError`].

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for vio-pipeline operations
#[derive(Error, Debug)]
pub enum VioError {
    /// Errors raised by the orchestration core
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<VioError>,
    },
}

impl VioError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        VioError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<toml::de::Error> for VioError {
    fn from(err: toml::de::Error) -> Self {
        VioError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VioError {
    fn from(err: serde_json::Error) -> Self {
        VioError::Serialization(err.to_string())
    }
}

/// Result type alias for vio-pipeline operations
pub type Result<T> = std::result::Result<T, VioError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<VioError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<VioError>::into(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Into::<VioError>::into(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VioError::Config("imu_only_frames must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: imu_only_frames must be positive"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = VioError::Config("test".to_string());
        let with_ctx = err.with_context("Failed to load params");
        assert!(with_ctx.to_string().contains("Failed to load params"));
    }

    #[test]
    fn test_pipeline_error_converts() {
        let err: VioError = PipelineError::ShutDown.into();
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), PipelineError> = Err(PipelineError::Terminated);
        let err = res.context("resuming").unwrap_err();
        assert!(err.to_string().starts_with("resuming"));
    }
}
