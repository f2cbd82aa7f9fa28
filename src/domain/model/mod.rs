// Domain models - Core types and data structures

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainError;

/// Kind of elementary track flowing through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Index used for per-track counter arrays
    pub fn index(self) -> usize {
        match self {
            TrackKind::Video => 0,
            TrackKind::Audio => 1,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Whether a compressed unit can be decoded independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Key,
    Delta,
}

impl ChunkType {
    pub fn is_key(self) -> bool {
        self == ChunkType::Key
    }
}

/// Output container family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
}

impl Container {
    /// File extension including the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => ".mp4",
            Container::Webm => ".webm",
        }
    }

    /// Parse a container name or file extension
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" | "m4v" | "mov" => Ok(Container::Mp4),
            "webm" | "mkv" => Ok(Container::Webm),
            other => Err(DomainError::BadArgs(format!("Unknown container: {}", other))),
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::Mp4 => write!(f, "mp4"),
            Container::Webm => write!(f, "webm"),
        }
    }
}

/// Video track parameters reported by the demux capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Codec string as the decode capability understands it
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second, when the container carries it
    pub framerate: Option<f64>,
    /// Average bits per second, when known
    pub bitrate: Option<u64>,
    /// Codec-specific decoder description (avcC, hvcC, ...)
    #[serde(skip)]
    pub description: Option<Vec<u8>>,
}

impl VideoFormat {
    /// Width divided by height
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 1.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// Audio track parameters reported by the demux capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: Option<u64>,
    #[serde(skip)]
    pub description: Option<Vec<u8>>,
}

/// Result of format detection, delivered exactly once per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub video: Option<VideoFormat>,
    pub audio: Option<AudioFormat>,
    /// Number of video samples in the source, when the container indexes them
    pub total_frame_count: Option<u64>,
    /// Source duration in microseconds
    pub duration_us: Option<i64>,
}

impl SourceDescriptor {
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Compressed unit read from the source container
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub kind: TrackKind,
    pub chunk_type: ChunkType,
    /// Presentation timestamp in microseconds
    pub timestamp_us: i64,
    /// Decode timestamp in microseconds for codecs that reorder frames
    pub decode_timestamp_us: Option<i64>,
    pub duration_us: i64,
    pub data: Vec<u8>,
}

impl EncodedSample {
    /// Key used to restore submission order after container interleaving
    pub fn ordering_key(&self) -> i64 {
        self.decode_timestamp_us.unwrap_or(self.timestamp_us)
    }
}

/// Audio layout of a decoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLayout {
    pub sample_rate: u32,
    pub channels: u32,
}

/// Decoded frame or audio buffer owned by the pipeline until it is handed to
/// the encode capability. Dropping it releases the underlying resources.
pub struct DecodedFrame {
    pub kind: TrackKind,
    pub timestamp_us: i64,
    pub duration_us: i64,
    /// Audio layout for decoded audio buffers
    pub audio_layout: Option<AudioLayout>,
    /// Capability-specific payload
    pub payload: Box<dyn Any + Send>,
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("kind", &self.kind)
            .field("timestamp_us", &self.timestamp_us)
            .field("duration_us", &self.duration_us)
            .field("audio_layout", &self.audio_layout)
            .finish_non_exhaustive()
    }
}

/// Compressed unit produced by an encode capability
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub kind: TrackKind,
    pub chunk_type: ChunkType,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub data: Vec<u8>,
    /// Decoder configuration emitted alongside the first chunk
    pub decoder_config: Option<Vec<u8>>,
}

/// How the output frame rate is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramerateMode {
    /// Use the explicit framerate of the output spec
    Fixed,
    /// Keep the source framerate
    PreserveOriginal,
}

/// Video rate control
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "value")]
pub enum RateControl {
    /// Constant bitrate in bits per second
    Constant(u64),
    /// Variable bitrate in bits per second
    Variable(u64),
    /// Constant quality
    Quantizer(u8),
}

impl RateControl {
    pub fn bitrate(&self) -> Option<u64> {
        match self {
            RateControl::Constant(bps) | RateControl::Variable(bps) => Some(*bps),
            RateControl::Quantizer(_) => None,
        }
    }

    pub fn quantizer(&self) -> Option<u8> {
        match self {
            RateControl::Quantizer(q) => Some(*q),
            _ => None,
        }
    }
}

/// Default video codec string (H.264 High, level 4.0)
pub const DEFAULT_VIDEO_CODEC: &str = "avc1.640028";
/// Default audio codec string (AAC-LC)
pub const DEFAULT_AUDIO_CODEC: &str = "mp4a.40.2";
/// Default output frame rate when nothing else is known
pub const DEFAULT_FRAMERATE: f64 = 30.0;

/// Caller-supplied description of the desired output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate_mode: FramerateMode,
    pub framerate: f64,
    pub rate_control: RateControl,
    pub video_codec: String,
    /// None disables the audio track entirely
    pub audio_codec: Option<String>,
    pub audio_bitrate: Option<u64>,
    /// Inferred from the video codec when absent
    pub container: Option<Container>,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            framerate_mode: FramerateMode::PreserveOriginal,
            framerate: DEFAULT_FRAMERATE,
            rate_control: RateControl::Variable(5_000_000),
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: Some(DEFAULT_AUDIO_CODEC.to_string()),
            audio_bitrate: Some(128_000),
            container: None,
        }
    }
}

impl OutputSpec {
    /// Validate the caller-supplied values
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.video_codec.trim().is_empty() {
            return Err(DomainError::BadArgs("Video codec must not be empty".to_string()));
        }
        if self.framerate_mode == FramerateMode::Fixed && !(self.framerate > 0.0) {
            return Err(DomainError::BadArgs(format!(
                "Framerate must be positive, got {}",
                self.framerate
            )));
        }
        match self.rate_control {
            RateControl::Constant(0) | RateControl::Variable(0) => {
                return Err(DomainError::BadArgs("Bitrate must be positive".to_string()));
            }
            RateControl::Quantizer(q) if q > 63 => {
                return Err(DomainError::BadArgs(format!(
                    "Quantizer must be within 0..=63, got {}",
                    q
                )));
            }
            _ => {}
        }
        if let Some(codec) = &self.audio_codec {
            if codec.trim().is_empty() {
                return Err(DomainError::BadArgs("Audio codec must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Output dimensions after applying the geometry rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
}

impl OutputGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for OutputGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Video encoder configuration derived from the source and the output spec
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoEncoderConfig {
    pub codec: String,
    pub geometry: OutputGeometry,
    pub framerate: f64,
    pub rate_control: RateControl,
    /// Keyframe interval in frames
    pub gop_size: u32,
}

/// Audio encoder configuration derived from the source and the output spec
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioEncoderConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: u64,
}

/// Configuration handed to a decode capability
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderConfig {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// Configuration handed to an encode capability
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderConfig {
    Video(VideoEncoderConfig),
    Audio(AudioEncoderConfig),
}

/// Codec identifiers understood by mux sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MuxCodec {
    Avc,
    Hevc,
    Vp9,
    Vp8,
    Av1,
    Aac,
    Opus,
}

impl MuxCodec {
    /// Codec tag as written by the mux sink
    pub fn tag(self) -> &'static str {
        match self {
            MuxCodec::Avc => "avc",
            MuxCodec::Hevc => "hevc",
            MuxCodec::Vp9 => "V_VP9",
            MuxCodec::Vp8 => "V_VP8",
            MuxCodec::Av1 => "V_AV1",
            MuxCodec::Aac => "aac",
            MuxCodec::Opus => "A_OPUS",
        }
    }
}

/// Video track declaration for a mux sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MuxVideoTrack {
    pub codec: MuxCodec,
    pub geometry: OutputGeometry,
    pub framerate: f64,
}

/// Audio track declaration for a mux sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MuxAudioTrack {
    pub codec: MuxCodec,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Mux sink construction parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MuxConfig {
    pub container: Container,
    pub video: MuxVideoTrack,
    pub audio: Option<MuxAudioTrack>,
}

/// Unit in which a mux sink expects timestamps and durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Microseconds,
    Milliseconds,
    /// Ticks of the given clock rate per second
    Timescale(u32),
}

impl TimestampUnit {
    /// Convert a microsecond value into this unit, rounding down
    pub fn from_micros(self, micros: i64) -> i64 {
        match self {
            TimestampUnit::Microseconds => micros,
            TimestampUnit::Milliseconds => micros.div_euclid(1_000),
            TimestampUnit::Timescale(rate) => {
                ((micros as i128 * rate as i128).div_euclid(1_000_000)) as i64
            }
        }
    }
}

/// Encoded chunk expressed in the mux sink's timestamp unit
#[derive(Debug, Clone)]
pub struct MuxChunk {
    pub kind: TrackKind,
    pub chunk_type: ChunkType,
    pub timestamp: i64,
    pub duration: i64,
    pub data: Vec<u8>,
    pub decoder_config: Option<Vec<u8>>,
}

/// Per-frame encode options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub key_frame: bool,
}

/// Lifecycle of a codec capability as observed by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Unconfigured,
    Configured,
    Closed,
}

/// Phase a progress event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Demuxing,
    Encoding,
    Finalizing,
    Done,
}

/// Progress snapshot delivered to the reporter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    /// Completion of the current stage, None when indeterminate
    pub stage_percent: Option<f64>,
    /// Weighted completion of the whole job, None when indeterminate
    pub overall_percent: Option<f64>,
    pub fps: Option<f64>,
    pub elapsed_ms: u64,
    pub eta_ms: Option<u64>,
}

#[cfg(test)]
mod tests;
