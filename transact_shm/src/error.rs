//! Error types for channel, arena and message operations

use thiserror::Error;

/// Errors that can occur while opening a channel or exchanging messages
#[derive(Error, Debug)]
pub enum ShmError {
    /// Both peer slots of the session are taken
    #[error("Session is full: {name}")]
    SessionFull {
        /// Session name
        name: String,
    },

    /// Peers supplied different handshake tokens
    #[error("Handshake token mismatch on session: {name}")]
    HandshakeMismatch {
        /// Session name
        name: String,
    },

    /// A blocking wait was cancelled or interrupted by a signal; retrying waits again
    #[error("Wait interrupted")]
    Interrupted,

    /// A bounded wait elapsed; retrying waits again
    #[error("Wait timed out: {operation}")]
    TimedOut {
        /// Operation that was waiting
        operation: &'static str,
    },

    /// The peer closed its end of the session or its process is gone
    #[error("Peer died")]
    PeerDied,

    /// An arena offset or free-chain link violates the layout invariants
    #[error("Arena corrupted: {reason}")]
    ArenaCorrupted {
        /// What invariant was broken
        reason: String,
    },

    /// No reusable block of the requested size and the bump pointer is at the end
    #[error("Arena exhausted: need at least {required_bytes} bytes")]
    ArenaExhausted {
        /// Arena size that would have satisfied the request
        required_bytes: usize,
    },

    /// A cursor access would cross the end of the message's block run
    #[error("Message overflow: {requested} bytes requested, {remaining} remaining")]
    MessageOverflow {
        /// Bytes the access needed
        requested: usize,
        /// Bytes left before the end bound
        remaining: usize,
    },

    /// A range-checked read or write saw a value outside the agreed bounds
    #[error("Value {value} outside of legal range [{min}, {max}]")]
    ValueOutOfRange {
        /// Offending value
        value: i64,
        /// Inclusive lower bound
        min: i64,
        /// Inclusive upper bound
        max: i64,
    },

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Arena size cannot be expressed as a usable block count
    #[error("Invalid arena size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Arena file not found
    #[error("Arena not found: {name}")]
    NotFound {
        /// Arena file path
        name: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::TimedOut { .. } | Self::ArenaExhausted { .. }
        )
    }

    /// Whether the session must be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ArenaCorrupted { .. })
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Self::ArenaCorrupted {
            reason: reason.into(),
        }
    }
}

/// Result type for channel, arena and message operations
pub type ShmResult<T> = Result<T, ShmError>;
