// Ports - Capability contracts consumed by the pipeline controller

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::errors::*;
use crate::domain::model::*;

/// Event produced by a demux source
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// Format detection finished. Sources may repeat this event; the
    /// pipeline honours only the first one.
    Ready(SourceDescriptor),
    /// Compressed sample, roughly in timestamp order
    Sample(EncodedSample),
    /// Share of the source parsed so far, 0..=100
    Progress(f64),
    /// No more samples
    End,
}

/// Port for container parsing.
///
/// `next_event` must be cancel-safe: dropping the future before it resolves
/// must not lose an event.
#[async_trait]
pub trait DemuxSource: Send {
    async fn next_event(&mut self) -> Result<DemuxEvent, DomainError>;
}

/// Port for a decode capability. Decoded frames are delivered through the
/// channel handed to [`CodecFactory::create_decoder`].
#[async_trait]
pub trait DecodeCapability: Send {
    /// Configure the decoder; calling it twice is a configuration error
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DomainError>;

    /// Submit one compressed sample
    fn decode(&mut self, sample: EncodedSample) -> Result<(), DomainError>;

    /// Ask the decoder to emit everything it still holds
    async fn flush(&mut self) -> Result<(), DomainError>;

    fn state(&self) -> CodecState;

    /// Number of submitted samples not yet turned into frames
    fn queue_depth(&self) -> usize;

    fn close(&mut self);
}

/// Port for an encode capability. Encoded chunks are delivered through the
/// channel handed to [`CodecFactory::create_encoder`].
///
/// Implementations may keep emitting chunks after `flush` resolves.
#[async_trait]
pub trait EncodeCapability: Send {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), DomainError>;

    /// Submit one decoded frame; the encoder takes ownership and releases it
    fn encode(&mut self, frame: DecodedFrame, options: EncodeOptions) -> Result<(), DomainError>;

    async fn flush(&mut self) -> Result<(), DomainError>;

    fn state(&self) -> CodecState;

    fn queue_depth(&self) -> usize;

    fn close(&mut self);
}

/// Factory for codec capabilities
pub trait CodecFactory: Send {
    fn create_decoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<DecodedFrame>,
    ) -> Result<Box<dyn DecodeCapability>, DomainError>;

    fn create_encoder(
        &mut self,
        kind: TrackKind,
        output: UnboundedSender<EncodedChunk>,
    ) -> Result<Box<dyn EncodeCapability>, DomainError>;
}

/// Port for the output container writer
#[async_trait]
pub trait MuxSink: Send {
    /// Unit the sink expects for timestamps and durations
    fn timestamp_unit(&self) -> TimestampUnit;

    async fn add_video_chunk(
        &mut self,
        chunk: MuxChunk,
        destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError>;

    async fn add_audio_chunk(
        &mut self,
        chunk: MuxChunk,
        destination: &mut dyn DestinationSink,
    ) -> Result<(), DomainError>;

    /// Write trailing metadata; no chunks may follow
    async fn finalize(&mut self, destination: &mut dyn DestinationSink) -> Result<(), DomainError>;
}

/// Factory for mux sinks, invoked once per job
pub trait MuxSinkFactory: Send {
    fn create(
        &mut self,
        config: &MuxConfig,
        destination: &dyn DestinationSink,
    ) -> Result<Box<dyn MuxSink>, DomainError>;
}

/// Port for the byte destination of the muxed output
#[async_trait]
pub trait DestinationSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), DomainError>;

    /// Commit the output
    async fn close(&mut self) -> Result<(), DomainError>;

    /// Discard partial output
    async fn abort(&mut self) -> Result<(), DomainError>;

    /// Local path backing the destination, for sinks that write files themselves
    fn staging_path(&self) -> Option<&Path> {
        None
    }
}

/// Port for progress reporting
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Reporter that discards every event
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _event: &ProgressEvent) {}
}
