//! Error handling module for TranscodeX

use thiserror::Error;

use crate::domain::errors::DomainError;
use crate::domain::model::TrackKind;

/// Main error type for transcode jobs
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// Container or codec could not be parsed or is unsupported
    #[error("Format detection failed: {message}")]
    FormatDetection { message: String },

    /// A capability rejected the codec/resolution/bitrate combination
    #[error("Codec configuration rejected for {track} track: {message}")]
    CodecConfiguration { track: TrackKind, message: String },

    /// A single frame or chunk could not be submitted
    #[error("Submission failed on {track} track: {message}")]
    TransientSubmission { track: TrackKind, message: String },

    /// No encoder output for an extended period
    #[error("Stalled on {track} track: {muxed} of {expected:?} chunks muxed")]
    StallTimeout {
        track: TrackKind,
        muxed: u64,
        expected: Option<u64>,
    },

    /// The job was cancelled by the caller
    #[error("Transcode cancelled")]
    Cancelled,

    /// Mux sink finalize or destination close failed
    #[error("Failed to finalize output: {message}")]
    Finalization { message: String },

    /// Capability transitioned to a failed or closed state mid-job
    #[error("Pipeline failed: {message}")]
    PipelineFailed { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Illegal state transition requested
    #[error("Illegal pipeline transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Capability error surfaced unchanged
    #[error(transparent)]
    Capability(#[from] DomainError),
}

impl TranscodeError {
    /// Whether this error is the distinguished cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranscodeError::Cancelled)
    }
}

/// Result type alias for transcode operations
pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;
