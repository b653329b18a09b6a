//! Render error types
//!
//! Unified error handling for the rendering coordination engine.
//!
//! `RenderError` is `Clone` because a single in-flight render fans its
//! outcome out to every deduplicated waiter.

use std::path::PathBuf;
use std::thread::ThreadId;
use std::time::Duration;

use thiserror::Error;

/// Unified render error type
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    /// Native decode or handle error
    #[error("Native engine failure: {0}")]
    NativeEngine(String),

    /// Decode ran out of memory even after the reduced-resolution retry
    #[error("Out of memory while rasterizing at {resolution:.1} dpi")]
    OutOfMemory { resolution: f64 },

    /// Coordinator-level timeout (visible to the timed-out caller only)
    #[error("Render timed out after {0:?}")]
    Timeout(Duration),

    /// The waiter's cancellation signal fired
    #[error("Render cancelled")]
    Cancelled,

    /// Requested page does not exist
    #[error("Page {page} not found (document has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: usize },

    /// Malformed request (page 0, non-positive zoom, ...)
    #[error("Invalid render request: {0}")]
    InvalidRequest(String),

    /// Engine was shut down or its owner thread is gone
    #[error("Render engine is shut down")]
    EngineShutdown,

    /// Temporary file or stream error
    #[error("IO error: {0}")]
    Io(String),
}

impl RenderError {
    /// Whether a fresh request for the same page may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::NativeEngine(_)
                | RenderError::OutOfMemory { .. }
                | RenderError::Timeout(_)
                | RenderError::Io(_)
        )
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<image::ImageError> for RenderError {
    fn from(err: image::ImageError) -> Self {
        RenderError::Io(format!("Image encoding failed: {}", err))
    }
}

#[cfg(feature = "mupdf-backend")]
impl From<mupdf::Error> for RenderError {
    fn from(err: mupdf::Error) -> Self {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("out of memory") {
            // Resolution is filled in by the strategy that observed the failure
            RenderError::OutOfMemory { resolution: 0.0 }
        } else {
            RenderError::NativeEngine(message)
        }
    }
}

/// Result type alias for render operations
pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// The native engine was reached from a thread that does not own it.
///
/// This is a programming error, never a recoverable condition: the gateway
/// turns it into a panic carrying this message.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("AffinityViolation: native engine owned by thread {expected:?} was called from thread {actual:?}")]
pub struct AffinityViolation {
    pub expected: ThreadId,
    pub actual: ThreadId,
}

/// Metrics export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write metrics to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
