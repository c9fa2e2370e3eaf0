#![forbid(unsafe_code)]
//! Error types for Tephra.
//!
//! Defines `TephraError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for embedding layers.  Everything that is
//! not representable here is a programming error and is enforced with
//! assertions (bad state transitions, lock-order violations, dirty-count
//! overflow).

use tephra_types::{BlockAddr, ParseError};
use thiserror::Error;

/// Unified error type for all Tephra operations.
#[derive(Debug, Error)]
pub enum TephraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at {addr:?}: {detail}")]
    Corruption { addr: BlockAddr, detail: String },

    #[error("invalid configuration or layout: {0}")]
    Format(String),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("backing read failed")]
    ReadFailed,

    #[error("buffer carries no readable data")]
    NoData,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("I/O pipeline is shutting down")]
    ShuttingDown,
}

impl TephraError {
    /// Convert this error into a POSIX errno for embedding layers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::ReadFailed | Self::NoData | Self::ShuttingDown => {
                libc::EIO
            }
            Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Unsupported(_) => libc::ENOTSUP,
        }
    }
}

/// Result alias using `TephraError`.
pub type Result<T> = std::result::Result<T, TephraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_exposed_codes() {
        assert_eq!(TephraError::NoData.to_errno(), libc::EIO);
        assert_eq!(TephraError::ReadFailed.to_errno(), libc::EIO);
        assert_eq!(
            TephraError::NotFound("sparse".to_owned()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(
            TephraError::Unsupported("spill id required").to_errno(),
            libc::ENOTSUP
        );
        assert_eq!(
            TephraError::Format("bad stripe count".to_owned()).to_errno(),
            libc::EINVAL
        );
    }
}
