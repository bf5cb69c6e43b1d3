//! Error types for the PCA engine.

use thiserror::Error;

/// Result type alias using the crate's [`PcaError`].
pub type Result<T> = std::result::Result<T, PcaError>;

/// Errors raised by the PCA engine, the result store and result persistence.
///
/// Validation errors (`Shape`, `OutOfRange`, `InvalidChunkSize`) are always
/// raised before any decomposition starts.
#[derive(Error, Debug)]
pub enum PcaError {
    /// Input matrix is empty, malformed, or its dimensions do not match.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Requested number of components violates the rank bound.
    #[error("n_comps={n_comps} is out of range: must be between 1 and {max}")]
    OutOfRange {
        /// Requested number of components
        n_comps: usize,
        /// Largest admissible number of components for this input
        max: usize,
    },

    /// Chunked execution was requested with a zero chunk size.
    #[error("chunk_size must be greater than 0 when chunked processing is enabled")]
    InvalidChunkSize,

    /// The linear-algebra backend failed (including non-convergence).
    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    /// The decomposition produced NaN or infinite values.
    #[error("Decomposition produced non-finite values in {0}")]
    NonFinite(&'static str),

    /// I/O failure while saving or loading a result.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a persisted result failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PcaError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        PcaError::Shape(msg.into())
    }
}
