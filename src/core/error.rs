// This module defines the error types for irjit using the thiserror crate. JitError is the
// main error enum covering the ways a compile, patch or setup step can fail: running out of
// code space (the one recoverable condition, answered by a full cache clear), instruction
// encoding failures bubbled up from iced-x86, failures to map or re-protect the executable
// region, references to unknown blocks, and malformed configuration values. JitResult<T> is
// the convenience alias used across the crate.

//! Error types for the JIT backend.

use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Main error type for the backend.
#[derive(Error, Debug)]
pub enum JitError {
    /// Not enough free bytes left in the code cache.
    ///
    /// Recoverable: the caller clears the whole cache and compiles again.
    #[error("code space exhausted: {remaining} bytes left, need at least {required}")]
    CodeSpaceExhausted { remaining: usize, required: usize },

    #[error("instruction encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("failed to allocate {size} bytes of executable memory: {source}")]
    CodeAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to change protection of {len} bytes at offset {offset:#x}: {source}")]
    Protection {
        offset: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// Patch bytes longer than the site reserved for them.
    #[error("patch of {len} bytes does not fit a {reserved}-byte site")]
    PatchOverflow { len: usize, reserved: usize },

    #[error("block {0} does not exist")]
    UnknownBlock(usize),

    #[error("invalid option {key}={value}")]
    InvalidOption { key: String, value: String },
}

/// Result type alias for backend operations.
pub type JitResult<T> = Result<T, JitError>;

impl JitError {
    /// Whether this error means "clear the cache and try again".
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, JitError::CodeSpaceExhausted { .. })
    }
}
