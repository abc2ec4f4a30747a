//! Error taxonomy for the pipeline.
//!
//! Every failure kind bubbles straight up to the driver, which stops issuing
//! stages, releases temporaries and reports the error.

use crate::io::mda::MdaError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while configuring, planning or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing, zero or inconsistent configuration, detected before scheduling
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The segment planner could not produce any segment
    #[error("planning error: {message}")]
    Planning { message: String },

    /// A processor (external or builtin) reported failure
    #[error("processor '{processor}' failed ({context}): {message}")]
    Invocation {
        processor: String,
        context: String,
        message: String,
    },

    /// Temporary storage could not be prepared or released
    #[error("resource error at {path}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact bookkeeping violation (duplicate live name, unknown handle)
    #[error("artifact error: {message}")]
    Artifact { message: String },

    /// An artifact read in-process could not be decoded
    #[error("malformed artifact: {0}")]
    Format(#[from] MdaError),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    pub fn invocation(
        processor: impl Into<String>,
        context: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Invocation {
            processor: processor.into(),
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(message: impl Into<String>) -> Self {
        Self::Artifact {
            message: message.into(),
        }
    }

    /// Name of the failing processor, if this is an invocation error.
    pub fn processor(&self) -> Option<&str> {
        match self {
            Self::Invocation { processor, .. } => Some(processor),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display_names_processor_and_context() {
        let err = PipelineError::invocation("detect_events", "segment 2", "exit status 1");
        let display = err.to_string();
        assert!(display.contains("detect_events"));
        assert!(display.contains("segment 2"));
        assert!(display.contains("exit status 1"));
        assert_eq!(err.processor(), Some("detect_events"));
    }

    #[test]
    fn test_format_error_from_mda() {
        let err: PipelineError = MdaError::UnsupportedType(-99).into();
        assert!(matches!(err, PipelineError::Format(_)));
        assert!(err.to_string().contains("-99"));
    }

    #[test]
    fn test_non_invocation_has_no_processor() {
        assert!(PipelineError::config("x").processor().is_none());
        assert!(PipelineError::planning("x").processor().is_none());
    }
}
