//! Error types shared across the crate.

use thiserror::Error;

/// All failure kinds a core operation can surface.
///
/// Every public operation is total: it returns either a success value or one
/// of these kinds. Errors are never used for ordinary control flow.
#[derive(Error, Debug)]
pub enum Error {
    /// A required vector/query input was absent.
    #[error("null input")]
    NullInput,

    /// No record exists for the given identifier.
    #[error("not found")]
    NotFound,

    /// Two vectors (or a vector and an index/store) disagree on dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the store/index/kernel was configured or built with.
        expected: usize,
        /// Dimension actually supplied.
        actual: usize,
    },

    /// A configuration value is structurally invalid (e.g. dimension doesn't
    /// divide evenly into product-quantization sub-vectors).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File header failed to parse (bad magic, truncated).
    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    /// On-disk format version newer than this build understands.
    #[error("unsupported version: found {found}, supports up to {supported}")]
    VersionUnsupported {
        /// Version read from the file.
        found: u32,
        /// Highest version this build can read.
        supported: u32,
    },

    /// WAL replay could not reconstruct a consistent state.
    #[error("WAL replay failed: {0}")]
    WalReplayFailed(String),

    /// The operation observed its cancellation signal and stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// A zero-copy guard outlived a remap of the backing memory map.
    #[error("epoch mismatch: {0}")]
    EpochMismatch(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_message() {
        let err = Error::DimensionMismatch {
            expected: 128,
            actual: 64,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 128, got 64");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn version_unsupported_message() {
        let err = Error::VersionUnsupported {
            found: 7,
            supported: 1,
        };
        assert_eq!(err.to_string(), "unsupported version: found 7, supports up to 1");
    }
}
