//! Error kinds surfaced by the artefact reduction engine.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for artred operations
pub type Result<T> = std::result::Result<T, ArtredError>;

/// Error type for artred operations
#[derive(Error, Debug)]
pub enum ArtredError {
    /// Configuration value outside its accepted range
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParams {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// Allocation or growth of an owned region failed
    #[error("Unable to allocate {requested} bytes for {what}")]
    OutOfMemory {
        /// Region being allocated
        what: &'static str,
        /// Bytes requested
        requested: u64,
    },

    /// Open, seek, read or write failure
    #[error("I/O failure on '{}': {source}", .path.display())]
    IoFailure {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Persisted file failed validation
    #[error("Corrupt file '{}': {reason}", .path.display())]
    CorruptFile {
        /// File being loaded
        path: PathBuf,
        /// What failed validation
        reason: String,
    },

    /// Raw input could not be parsed as FASTA/FASTQ
    #[error("Malformed input '{}': {reason}", .path.display())]
    MalformedInput {
        /// File being parsed
        path: PathBuf,
        /// Parse failure
        reason: String,
    },

    /// Too few sequences for downstream stages
    #[error("Insufficient data {stage}: {found} sequences, at least {required} required")]
    InsufficientData {
        /// Stage at which the count was checked
        stage: &'static str,
        /// Sequences available
        found: u64,
        /// Minimum required
        required: u64,
    },

    /// Word reference does not address a sequence header
    #[error("Word {word_index} is not a sequence header")]
    NotAHeader {
        /// Offending word offset in the arena
        word_index: usize,
    },

    /// Sequence length outside the storable range
    #[error("Sequence length {len} outside 1..={max}")]
    InvalidLength {
        /// Length supplied
        len: usize,
        /// Maximum accepted
        max: usize,
    },
}

impl ArtredError {
    /// Shorthand for an `InvalidParams` error.
    pub fn invalid(parameter: &str, reason: impl Into<String>) -> Self {
        ArtredError::InvalidParams { parameter: parameter.to_string(), reason: reason.into() }
    }

    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        ArtredError::IoFailure { path: path.as_ref().to_path_buf(), source }
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        ArtredError::CorruptFile { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }

    pub fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        ArtredError::MalformedInput { path: path.as_ref().to_path_buf(), reason: reason.into() }
    }
}
