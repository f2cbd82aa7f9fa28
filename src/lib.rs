//! TranscodeX Library
//!
//! An in-process media transcoding pipeline: a controller that drives
//! demux, decode, encode and mux capabilities through a fixed lifecycle,
//! with derived output parameters and timestamp normalization.

pub mod adapters;
pub mod app;
pub mod cli;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ports;

// Re-export commonly used types
pub use domain::errors::DomainError;
pub use domain::model::{OutputSpec, SourceDescriptor, TrackKind};
pub use engine::{PipelineController, PipelineIo, PipelineState, PipelineTuning, TranscodeReport};
pub use error::{TranscodeError, TranscodeResult};
