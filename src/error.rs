use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The file is not a signature file we can load: wrong magic, an
    /// unsupported version, or a region table that does not fit the file.
    #[error("{path}: not a valid signature file: {reason}")]
    BadSignature { path: PathBuf, reason: String },

    /// A disk read hit EOF before the requested range was complete.
    #[error("short read at sector {sector}: wanted {wanted} bytes, got {got}")]
    ShortRead { sector: u64, wanted: u64, got: u64 },

    /// I/O error with the operation that failed.
    #[error("I/O error {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a signature whose region start would underflow after the
    /// partition offset is subtracted.
    #[error("region at sector {start} lies below partition offset {offset}")]
    RegionUnderPartition { start: u64, offset: u64 },

    /// A value does not fit the 32-bit wire format. Signature writes
    /// recover from this by upgrading the format version; it is a hard
    /// error only where no wider format exists.
    #[error("value {value} does not fit the 32-bit on-disk format")]
    WidthOverflow { value: u64 },

    /// A fixup or relocation lies outside sector bounds. This indicates a
    /// bug in whatever filesystem probe produced the entry.
    #[error("fixup out of bounds: offset {offset} + size {size} exceeds sector size")]
    FixupViolation { offset: u64, size: u64 },

    /// The caller requested cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn bad_signature(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::BadSignature {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
