// Domain rules - Parameter derivation policies

use std::path::Path;

use serde::Serialize;

use crate::domain::errors::*;
use crate::domain::model::*;

/// Relative aspect-ratio difference tolerated before refitting dimensions
pub const ASPECT_RATIO_TOLERANCE: f64 = 0.01;

/// Bitrates accepted by AAC encode capabilities
pub const AAC_BITRATES: [u64; 4] = [96_000, 128_000, 160_000, 192_000];

/// Share of a size budget reserved for container overhead
pub const CONTAINER_OVERHEAD_RATIO: f64 = 0.02;

/// Lowest video bitrate produced by target-size planning
pub const MINIMUM_VIDEO_BITRATE: u64 = 100_000;

/// Keyframe interval in seconds
const KEYFRAME_INTERVAL_SECONDS: f64 = 2.0;

/// Output dimension rules
pub struct GeometryResolver;

impl GeometryResolver {
    /// Resolve output dimensions from the source and the requested size.
    ///
    /// A single requested dimension derives the other from the source aspect
    /// ratio. When both are given and their ratio differs from the source by
    /// more than [`ASPECT_RATIO_TOLERANCE`], the dimension that would stretch
    /// the picture is recomputed. The result never exceeds the source on
    /// either axis and both dimensions are even.
    pub fn resolve(
        source_width: u32,
        source_height: u32,
        target_width: Option<u32>,
        target_height: Option<u32>,
    ) -> Result<OutputGeometry, DomainError> {
        if source_width < 2 || source_height < 2 {
            return Err(DomainError::InvalidFormat(format!(
                "Source dimensions {}x{} are too small to encode",
                source_width, source_height
            )));
        }

        let sw = source_width as f64;
        let sh = source_height as f64;
        let source_ratio = sw / sh;

        let target_width = target_width.filter(|w| *w > 0);
        let target_height = target_height.filter(|h| *h > 0);

        let (mut width, mut height) = match (target_width, target_height) {
            (None, None) => (sw, sh),
            (Some(w), None) => (w as f64, (w as f64 / source_ratio).round()),
            (None, Some(h)) => ((h as f64 * source_ratio).round(), h as f64),
            (Some(w), Some(h)) => {
                let (w, h) = (w as f64, h as f64);
                let target_ratio = w / h;
                if ((target_ratio - source_ratio) / source_ratio).abs() > ASPECT_RATIO_TOLERANCE {
                    if target_ratio > source_ratio {
                        ((h * source_ratio).round(), h)
                    } else {
                        (w, (w / source_ratio).round())
                    }
                } else {
                    (w, h)
                }
            }
        };

        // Never upscale
        if width > sw || height > sh {
            let scale = (sw / width).min(sh / height);
            width = (width * scale).round();
            height = (height * scale).round();
        }

        Ok(OutputGeometry::new(
            Self::even_within(width, source_width),
            Self::even_within(height, source_height),
        ))
    }

    /// Round to the nearest even value without exceeding `limit`
    fn even_within(value: f64, limit: u32) -> u32 {
        let rounded = ((value / 2.0).round() * 2.0).max(2.0) as u32;
        if rounded > limit {
            limit - limit % 2
        } else {
            rounded
        }
    }
}

/// H.264 level selection from the coded picture area
pub struct H264LevelSelector;

impl H264LevelSelector {
    /// Largest coded area for Main profile level 3.1
    pub const LEVEL_3_1_MAX_AREA: u64 = 921_600;
    /// Largest coded area for High profile level 4.0
    pub const LEVEL_4_0_MAX_AREA: u64 = 2_097_152;
    /// Largest coded area for High profile level 5.0
    pub const LEVEL_5_0_MAX_AREA: u64 = 8_912_896;

    /// Whether the codec string names the H.264 family
    pub fn is_h264(codec: &str) -> bool {
        let codec = codec.to_ascii_lowercase();
        codec.starts_with("avc1.") || codec.starts_with("avc3.")
    }

    /// Area after rounding the height up to whole macroblock rows
    pub fn coded_area(geometry: &OutputGeometry) -> u64 {
        let coded_height = (geometry.height as u64).div_ceil(16) * 16;
        geometry.width as u64 * coded_height
    }

    /// Pick the profile/level codec string for the output geometry.
    ///
    /// Returns the codec string and the geometry to encode at. Areas beyond
    /// level 5.0 are scaled down to fit a 1920x1080 box at level 4.0,
    /// keeping the aspect ratio. Non-H.264 codecs pass through unchanged.
    pub fn select(codec: &str, geometry: OutputGeometry) -> (String, OutputGeometry) {
        if !Self::is_h264(codec) {
            return (codec.to_string(), geometry);
        }

        let prefix = codec[..5].to_ascii_lowercase();
        let area = Self::coded_area(&geometry);
        if area <= Self::LEVEL_3_1_MAX_AREA {
            (format!("{}4d001f", prefix), geometry)
        } else if area <= Self::LEVEL_4_0_MAX_AREA {
            (format!("{}640028", prefix), geometry)
        } else if area <= Self::LEVEL_5_0_MAX_AREA {
            (format!("{}640032", prefix), geometry)
        } else {
            (format!("{}640028", prefix), Self::fit_full_hd(geometry))
        }
    }

    /// Largest even geometry with the same aspect ratio inside 1920x1080
    fn fit_full_hd(geometry: OutputGeometry) -> OutputGeometry {
        let (w, h) = (geometry.width as f64, geometry.height as f64);
        let scale = (1920.0 / w).min(1080.0 / h).min(1.0);
        OutputGeometry::new(
            GeometryResolver::even_within(w * scale, geometry.width.min(1920)),
            GeometryResolver::even_within(h * scale, geometry.height.min(1080)),
        )
    }
}

/// AAC bitrate validation
pub struct AudioBitrateRules;

impl AudioBitrateRules {
    /// Whether the codec string names AAC-LC or HE-AAC
    pub fn is_aac(codec: &str) -> bool {
        codec.starts_with("mp4a.40.2") || codec.starts_with("mp4a.40.5")
    }

    /// Snap the requested bitrate to the nearest accepted AAC bitrate.
    ///
    /// Ties resolve to the lower value. Non-AAC codecs keep the request.
    pub fn snap(codec: &str, requested: u64) -> u64 {
        if !Self::is_aac(codec) {
            return requested;
        }
        AAC_BITRATES
            .iter()
            .copied()
            .fold(AAC_BITRATES[0], |best, candidate| {
                if candidate.abs_diff(requested) < best.abs_diff(requested) {
                    candidate
                } else {
                    best
                }
            })
    }
}

/// Codec string to mux sink codec mapping
pub struct MuxCodecMapper;

impl MuxCodecMapper {
    /// Map a video codec string; unknown codecs fall back to AVC
    pub fn video(codec: &str) -> MuxCodec {
        let codec = codec.to_ascii_lowercase();
        if codec.starts_with("avc") || codec.starts_with("h264") {
            MuxCodec::Avc
        } else if codec.starts_with("hev") || codec.starts_with("hvc") || codec.starts_with("h265") {
            MuxCodec::Hevc
        } else if codec.starts_with("vp09") || codec.starts_with("vp9") {
            MuxCodec::Vp9
        } else if codec.starts_with("vp08") || codec.starts_with("vp8") {
            MuxCodec::Vp8
        } else if codec.starts_with("av01") {
            MuxCodec::Av1
        } else {
            MuxCodec::Avc
        }
    }

    /// Map an audio codec string; unknown codecs fall back to AAC
    pub fn audio(codec: &str) -> MuxCodec {
        let codec = codec.to_ascii_lowercase();
        if codec.starts_with("opus") {
            MuxCodec::Opus
        } else {
            MuxCodec::Aac
        }
    }
}

/// Container and output naming rules
pub struct ContainerRules;

impl ContainerRules {
    /// VP8/VP9/AV1 go into WebM, everything else into MP4
    pub fn infer(video_codec: &str) -> Container {
        let codec = video_codec.to_ascii_lowercase();
        if codec.starts_with("vp") || codec.starts_with("av01") {
            Container::Webm
        } else {
            Container::Mp4
        }
    }

    /// Container for the output spec, explicit or inferred
    pub fn resolve(spec: &OutputSpec) -> Container {
        spec.container.unwrap_or_else(|| Self::infer(&spec.video_codec))
    }

    /// Output file name derived from the input name and rate control.
    ///
    /// `clip.mov` at 5 Mbps into MP4 becomes `clip_5.0Mbps.mp4`; quantizer
    /// mode uses a `_q23` suffix instead.
    pub fn output_file_name(input: &Path, rate_control: &RateControl, container: Container) -> String {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let suffix = match rate_control {
            RateControl::Constant(bps) | RateControl::Variable(bps) => {
                format!("{:.1}Mbps", *bps as f64 / 1_000_000.0)
            }
            RateControl::Quantizer(q) => format!("q{}", q),
        };
        format!("{}_{}{}", stem, suffix, container.extension())
    }

    /// Video bitrate that lands the output near `target_bytes`.
    ///
    /// Reserves container overhead and the audio budget, with a floor of
    /// [`MINIMUM_VIDEO_BITRATE`].
    pub fn target_video_bitrate(
        target_bytes: u64,
        duration_seconds: f64,
        audio_bitrate: Option<u64>,
    ) -> Result<u64, DomainError> {
        if !(duration_seconds > 0.0) {
            return Err(DomainError::BadArgs(
                "Duration must be positive to plan a target size".to_string(),
            ));
        }
        let usable_bits = target_bytes as f64 * 8.0 * (1.0 - CONTAINER_OVERHEAD_RATIO);
        let total_bitrate = usable_bits / duration_seconds;
        let video_bitrate = total_bitrate - audio_bitrate.unwrap_or(0) as f64;
        Ok((video_bitrate.floor() as u64).max(MINIMUM_VIDEO_BITRATE))
    }
}

/// Frame rate selection
pub struct FramerateRules;

impl FramerateRules {
    pub fn resolve(spec: &OutputSpec, source: &VideoFormat) -> f64 {
        match spec.framerate_mode {
            FramerateMode::Fixed => spec.framerate,
            FramerateMode::PreserveOriginal => source
                .framerate
                .filter(|fps| fps.is_finite() && *fps > 0.0)
                .unwrap_or(spec.framerate),
        }
    }
}

/// Everything the pipeline needs to configure encoders and the mux sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedParameters {
    pub video: VideoEncoderConfig,
    pub audio: Option<AudioEncoderConfig>,
    pub container: Container,
    /// Set when the H.264 level rules forced a smaller picture
    pub downscaled: bool,
}

impl DerivedParameters {
    /// Mux sink declaration for these parameters, with or without audio
    pub fn mux_config(&self, include_audio: bool) -> MuxConfig {
        MuxConfig {
            container: self.container,
            video: MuxVideoTrack {
                codec: MuxCodecMapper::video(&self.video.codec),
                geometry: self.video.geometry,
                framerate: self.video.framerate,
            },
            audio: self.audio.as_ref().filter(|_| include_audio).map(|audio| MuxAudioTrack {
                codec: MuxCodecMapper::audio(&audio.codec),
                sample_rate: audio.sample_rate,
                channels: audio.channels,
            }),
        }
    }
}

/// Derive encoder and mux parameters from the detected source and the output spec
pub struct ParameterDeriver;

impl ParameterDeriver {
    pub fn derive(source: &SourceDescriptor, spec: &OutputSpec) -> Result<DerivedParameters, DomainError> {
        spec.validate()?;

        let video = source
            .video
            .as_ref()
            .ok_or_else(|| DomainError::InvalidFormat("Source has no video track".to_string()))?;

        let geometry = GeometryResolver::resolve(video.width, video.height, spec.width, spec.height)?;
        let (codec, encode_geometry) = H264LevelSelector::select(&spec.video_codec, geometry);
        let framerate = FramerateRules::resolve(spec, video);
        let gop_size = ((framerate * KEYFRAME_INTERVAL_SECONDS).round() as u32).max(1);

        let audio = match (&source.audio, &spec.audio_codec) {
            (Some(format), Some(codec)) => {
                let requested = spec.audio_bitrate.or(format.bitrate).unwrap_or(128_000);
                Some(AudioEncoderConfig {
                    codec: codec.clone(),
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                    bitrate: AudioBitrateRules::snap(codec, requested),
                })
            }
            _ => None,
        };

        Ok(DerivedParameters {
            video: VideoEncoderConfig {
                codec,
                geometry: encode_geometry,
                framerate,
                rate_control: spec.rate_control,
                gop_size,
            },
            audio,
            container: ContainerRules::resolve(spec),
            downscaled: encode_geometry != geometry,
        })
    }
}
