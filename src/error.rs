//! Error types for `pmq`.

use std::path::PathBuf;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors returned by the `pmq` crate.
///
/// The split matters to operators: `Io` means "disk failed", `Integrity` means "disk (or
/// memory) lied", `OutOfBounds` means "that message is gone (or not there yet), re-seek".
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt queue data (chunk header, offset table, slot framing, MSN continuity).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The requested message was discarded concurrently or does not exist yet.
    #[error("message {msn} out of bounds")]
    OutOfBounds {
        /// The message sequence number that could not be reached.
        msn: u64,
    },

    /// Format error in the state file (magic, version, sizes).
    #[error("format error: {0}")]
    Format(String),

    /// CRC mismatch on the commit record.
    #[error("crc mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CrcMismatch {
        /// CRC stored in the record.
        expected: u32,
        /// CRC computed from the bytes that were read.
        actual: u32,
    },

    /// Invalid argument (empty or oversized message).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state (operation not allowed in current state).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),
}

impl QueueError {
    /// Shorthand for an integrity error.
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Whether this is an out-of-bounds result (the caller should re-seek).
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Self::OutOfBounds { .. })
    }

    /// Whether this is an integrity error.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// A copy of this error, for replaying a sticky reader failure.
    ///
    /// `std::io::Error` is not `Clone`; the copy keeps its kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Integrity(m) => Self::Integrity(m.clone()),
            Self::OutOfBounds { msn } => Self::OutOfBounds { msn: *msn },
            Self::Format(m) => Self::Format(m.clone()),
            Self::CrcMismatch { expected, actual } => Self::CrcMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::InvalidArgument(m) => Self::InvalidArgument(m.clone()),
            Self::InvalidState(m) => Self::InvalidState(m.clone()),
            Self::InvalidConfig(m) => Self::InvalidConfig(m.clone()),
            Self::MissingPath(p) => Self::MissingPath(p.clone()),
        }
    }
}
