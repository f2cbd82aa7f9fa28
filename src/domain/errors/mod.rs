// Domain errors - Error types raised by capabilities and domain rules

use std::fmt;

/// Domain-specific error types
#[derive(Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Invalid arguments provided
    BadArgs(String),
    /// Unparseable or unsupported container data
    InvalidFormat(String),
    /// Codec not supported by a capability
    UnsupportedCodec(String),
    /// Capability rejected its configuration
    Configuration(String),
    /// A single unit could not be submitted
    Submission(String),
    /// Capability is closed and accepts no more work
    CapabilityClosed(String),
    /// Mux sink rejected a chunk because its timestamp went backwards
    TimestampOrdering(String),
    /// I/O failure in a sink or source
    Io(String),
    /// Internal error
    Internal(String),
}

impl DomainError {
    /// Whether this error is the mux sink refusing an out-of-order timestamp
    pub fn is_timestamp_ordering(&self) -> bool {
        matches!(self, DomainError::TimestampOrdering(_))
    }

    /// Whether the capability that raised this error is no longer usable
    pub fn is_fatal_for_capability(&self) -> bool {
        matches!(
            self,
            DomainError::CapabilityClosed(_) | DomainError::Configuration(_)
        )
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::BadArgs(msg) => write!(f, "Bad arguments: {}", msg),
            DomainError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            DomainError::UnsupportedCodec(msg) => write!(f, "Unsupported codec: {}", msg),
            DomainError::Configuration(msg) => write!(f, "Configuration rejected: {}", msg),
            DomainError::Submission(msg) => write!(f, "Submission failed: {}", msg),
            DomainError::CapabilityClosed(msg) => write!(f, "Capability closed: {}", msg),
            DomainError::TimestampOrdering(msg) => write!(f, "Timestamp ordering violation: {}", msg),
            DomainError::Io(msg) => write!(f, "I/O error: {}", msg),
            DomainError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DomainError {}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}
