//! Error kinds surfaced by the sort pipeline.
//!
//! Library functions return `anyhow::Result`; the variants below are the
//! classified failures callers can recover with `downcast_ref::<SortError>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Classified failure of the sort pipeline
#[derive(Error, Debug)]
pub enum SortError {
    /// Rejected before any work started; no output file is created
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The record codec failed for one ID, aborting the whole block
    #[error("Failed to encode record for id {id:#x}: {reason}")]
    Codec {
        /// The ID that could not be encoded
        id: u64,
        /// Explanation from the codec
        reason: String,
    },

    /// Reading, writing or truncating a segment or the output failed.
    ///
    /// Truncated segment data is not recoverable once this is reported.
    #[error("I/O failure on {}", path.display())]
    Io {
        /// File the operation was acting on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A merge lane stopped without sending its end-of-lane marker
    #[error("Merge lane {lane} disconnected before end of lane")]
    LaneDisconnected {
        /// Lane index
        lane: usize,
    },

    /// The merge coordinator stopped without sending end of stream
    #[error("Merge coordinator disconnected before end of stream")]
    Disconnected,
}

impl SortError {
    /// Builds a `Configuration` error from any displayable reason
    pub fn config(reason: impl Into<String>) -> Self {
        SortError::Configuration(reason.into())
    }

    /// Returns a closure wrapping an `io::Error` with the path it occurred on
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SortError::Io { path, source }
    }
}
