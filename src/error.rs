//! Central error types for framestream.
//!
//! Every fallible operation in the capture pipeline returns [`PipelineResult`].
//! Errors serialize as their display string so recording front-ends can show
//! them verbatim.

use serde::Serialize;
use thiserror::Error;

/// Main error type for the capture pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration rejected before the session started
    #[error("Invalid recording configuration: {0}")]
    Config(String),

    /// No usable ffmpeg binary
    #[error("FFmpeg not found. Please ensure FFmpeg is installed or bundled.")]
    EncoderNotFound,

    /// The encoder subprocess could not be launched
    #[error("Encoder process failed to start: {0}. Please check if video parameters are entered correctly or video codec is supported by provided container.")]
    EncoderStart(String),

    /// Writing a frame into the encoder input failed mid-stream
    #[error("Encoder process finished abruptly while writing frame {frame}: {source}. Please check if you have enough storage or video parameters are entered correctly.")]
    EncoderWrite {
        frame: u64,
        #[source]
        source: std::io::Error,
    },

    /// A previous fatal error already tore the pipeline down
    #[error("Recording pipeline failed: {0}")]
    PipelineFailed(String),

    /// GPU readback or synchronization failed
    #[error("GPU error: {0}")]
    Gpu(String),

    /// No conversion exists between the two pixel layouts
    #[error("Unsupported pixel conversion: {from} -> {to}")]
    UnsupportedConversion { from: String, to: String },

    /// A pipeline worker thread panicked
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    /// Filesystem or pipe error outside the frame write path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Serialize as the error message string.
impl Serialize for PipelineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<String> for PipelineError {
    fn from(msg: String) -> Self {
        PipelineError::Other(msg)
    }
}

impl From<&str> for PipelineError {
    fn from(msg: &str) -> Self {
        PipelineError::Other(msg.to_string())
    }
}

/// Extension trait for adding context to Results.
///
/// Similar to anyhow's `Context` trait, this allows chaining context
/// information onto errors for better debugging.
pub trait ResultExt<T> {
    /// Add context to an error, converting it to PipelineError::Other.
    fn context(self, msg: &str) -> PipelineResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn context(self, msg: &str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::Other(format!("{}: {}", msg, e)))
    }
}

/// Extension trait for adding context to Option types.
pub trait OptionExt<T> {
    /// Convert None to PipelineError::Other with the given message.
    fn context(self, msg: &str) -> PipelineResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context(self, msg: &str) -> PipelineResult<T> {
        self.ok_or_else(|| PipelineError::Other(msg.to_string()))
    }
}

/// Type alias for Results using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Config("width must be even".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid recording configuration: width must be even"
        );
    }

    #[test]
    fn test_error_serialization() {
        let err = PipelineError::EncoderNotFound;
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("FFmpeg not found"));
    }

    #[test]
    fn test_write_error_keeps_source() {
        use std::error::Error as _;

        let err = PipelineError::EncoderWrite {
            frame: 7,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
        };
        assert!(err.to_string().contains("frame 7"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PipelineError = io_err.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<(), &str> = Err("original error");
        let msg = result.context("operation failed").unwrap_err().to_string();
        assert!(msg.contains("operation failed"));
        assert!(msg.contains("original error"));
    }

    #[test]
    fn test_option_ext_context() {
        let opt: Option<i32> = None;
        let result = opt.context("value was missing");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("value was missing"));
        assert_eq!(Some(5).context("unused").unwrap(), 5);
    }
}
