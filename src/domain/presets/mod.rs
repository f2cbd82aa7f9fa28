// Built-in output presets

use serde::Serialize;

use crate::domain::errors::DomainError;
use crate::domain::model::*;

/// Named output configuration shipped with the tool
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub container: Container,
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
    /// None keeps the source dimensions
    pub size: Option<(u32, u32)>,
    /// None keeps the source frame rate
    pub framerate: Option<f64>,
    pub rate_control: RateControl,
    pub audio_bitrate: u64,
}

impl Preset {
    /// Convert the preset into an output spec
    pub fn to_output_spec(&self) -> OutputSpec {
        let (width, height) = match self.size {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        let (framerate_mode, framerate) = match self.framerate {
            Some(fps) => (FramerateMode::Fixed, fps),
            None => (FramerateMode::PreserveOriginal, DEFAULT_FRAMERATE),
        };
        OutputSpec {
            width,
            height,
            framerate_mode,
            framerate,
            rate_control: self.rate_control,
            video_codec: self.video_codec.to_string(),
            audio_codec: Some(self.audio_codec.to_string()),
            audio_bitrate: Some(self.audio_bitrate),
            container: Some(self.container),
        }
    }
}

const fn preset(
    name: &'static str,
    description: &'static str,
    video_codec: &'static str,
    size: (u32, u32),
    framerate: f64,
    rate_control: RateControl,
    audio_bitrate: u64,
) -> Preset {
    Preset {
        name,
        description,
        container: Container::Mp4,
        video_codec,
        audio_codec: "mp4a.40.2",
        size: Some(size),
        framerate: Some(framerate),
        rate_control,
        audio_bitrate,
    }
}

/// Presets in display order
pub const BUILTIN_PRESETS: &[Preset] = &[
    preset("qp-1080p60", "Constant quality, high, 1080p60", "avc1.640028", (1920, 1080), 60.0, RateControl::Quantizer(23), 192_000),
    preset("qp-1080p30", "Constant quality, standard, 1080p30", "avc1.640028", (1920, 1080), 30.0, RateControl::Quantizer(28), 128_000),
    preset("qp-720p60", "Constant quality, high, 720p60", "avc1.42001f", (1280, 720), 60.0, RateControl::Quantizer(23), 128_000),
    preset("qp-720p30", "Constant quality, standard, 720p30", "avc1.42001f", (1280, 720), 30.0, RateControl::Quantizer(28), 128_000),
    Preset {
        name: "keep-mp4",
        description: "Keep source size and frame rate, H.264/AAC in MP4",
        container: Container::Mp4,
        video_codec: "avc1.640028",
        audio_codec: "mp4a.40.2",
        size: None,
        framerate: None,
        rate_control: RateControl::Quantizer(28),
        audio_bitrate: 128_000,
    },
    Preset {
        name: "keep-webm",
        description: "Keep source size and frame rate, VP9/Opus in WebM",
        container: Container::Webm,
        video_codec: "vp09.00.31.08",
        audio_codec: "opus",
        size: None,
        framerate: None,
        rate_control: RateControl::Quantizer(28),
        audio_bitrate: 128_000,
    },
    preset("vbr-4k60", "Variable bitrate 20 Mbps, 2160p60", "avc1.640028", (3840, 2160), 60.0, RateControl::Variable(20_000_000), 192_000),
    preset("vbr-4k30", "Variable bitrate 15 Mbps, 2160p30", "avc1.640028", (3840, 2160), 30.0, RateControl::Variable(15_000_000), 192_000),
    preset("vbr-1440p60", "Variable bitrate 12 Mbps, 1440p60", "avc1.640028", (2560, 1440), 60.0, RateControl::Variable(12_000_000), 160_000),
    preset("vbr-1440p30", "Variable bitrate 8 Mbps, 1440p30", "avc1.640028", (2560, 1440), 30.0, RateControl::Variable(8_000_000), 160_000),
    preset("vbr-1080p60", "Variable bitrate 8 Mbps, 1080p60", "avc1.640028", (1920, 1080), 60.0, RateControl::Variable(8_000_000), 128_000),
    preset("vbr-1080p30", "Variable bitrate 5 Mbps, 1080p30", "avc1.640028", (1920, 1080), 30.0, RateControl::Variable(5_000_000), 128_000),
    preset("vbr-720p60", "Variable bitrate 5 Mbps, 720p60", "avc1.42001f", (1280, 720), 60.0, RateControl::Variable(5_000_000), 128_000),
    preset("vbr-720p30", "Variable bitrate 3 Mbps, 720p30", "avc1.42001f", (1280, 720), 30.0, RateControl::Variable(3_000_000), 128_000),
    preset("vbr-480p30", "Variable bitrate 1.5 Mbps, 480p30", "avc1.42001e", (854, 480), 30.0, RateControl::Variable(1_500_000), 96_000),
];

/// Look up a preset by name, case-insensitively
pub fn find_preset(name: &str) -> Result<&'static Preset, DomainError> {
    BUILTIN_PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| DomainError::BadArgs(format!("Unknown preset: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_preset() {
        let preset = find_preset("VBR-1080p30").unwrap();
        assert_eq!(preset.rate_control, RateControl::Variable(5_000_000));
        assert!(find_preset("vbr-8k").is_err());
    }

    #[test]
    fn test_preset_names_are_unique_and_specs_valid() {
        for (i, preset) in BUILTIN_PRESETS.iter().enumerate() {
            assert!(
                BUILTIN_PRESETS[i + 1..].iter().all(|p| p.name != preset.name),
                "duplicate preset {}",
                preset.name
            );
            assert!(preset.to_output_spec().validate().is_ok(), "{}", preset.name);
        }
    }

    #[test]
    fn test_keep_presets_preserve_source() {
        let spec = find_preset("keep-webm").unwrap().to_output_spec();
        assert_eq!(spec.width, None);
        assert_eq!(spec.framerate_mode, FramerateMode::PreserveOriginal);
        assert_eq!(spec.container, Some(Container::Webm));
        assert_eq!(spec.audio_codec.as_deref(), Some("opus"));
    }
}
