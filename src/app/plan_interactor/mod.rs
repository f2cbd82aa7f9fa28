// Plan interactor - Resolves output parameters without running a job

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::domain::errors::*;
use crate::domain::model::*;
use crate::domain::rules::*;

/// What a job would produce for a given source
#[derive(Debug, Clone, Serialize)]
pub struct TranscodePlan {
    pub parameters: DerivedParameters,
    pub video_mux_tag: &'static str,
    pub audio_mux_tag: Option<&'static str>,
    /// Suggested file name, when the input path is known
    pub output_file_name: Option<String>,
}

impl TranscodePlan {
    /// Human readable summary, one setting per line
    pub fn describe(&self) -> String {
        let video = &self.parameters.video;
        let mut lines = vec![
            format!("Container:     {}", self.parameters.container),
            format!("Geometry:      {}", video.geometry),
            format!("Video codec:   {} ({})", video.codec, self.video_mux_tag),
            format!("Framerate:     {:.3}", video.framerate),
            format!("Rate control:  {}", describe_rate_control(&video.rate_control)),
            format!("GOP size:      {}", video.gop_size),
        ];
        if self.parameters.downscaled {
            lines.push("Note:          downscaled to fit the codec level".to_string());
        }
        match (&self.parameters.audio, self.audio_mux_tag) {
            (Some(audio), Some(tag)) => {
                lines.push(format!("Audio codec:   {} ({})", audio.codec, tag));
                lines.push(format!(
                    "Audio:         {} Hz, {} ch, {} bps",
                    audio.sample_rate, audio.channels, audio.bitrate
                ));
            }
            _ => lines.push("Audio:         none".to_string()),
        }
        if let Some(name) = &self.output_file_name {
            lines.push(format!("Output:        {}", name));
        }
        lines.join("\n")
    }
}

fn describe_rate_control(rate_control: &RateControl) -> String {
    match rate_control {
        RateControl::Constant(bps) => format!("CBR {:.1} Mbps", *bps as f64 / 1_000_000.0),
        RateControl::Variable(bps) => format!("VBR {:.1} Mbps", *bps as f64 / 1_000_000.0),
        RateControl::Quantizer(q) => format!("QP {}", q),
    }
}

/// Interactor for the planning use case
pub struct PlanInteractor {
    spec: OutputSpec,
}

impl PlanInteractor {
    pub fn new(spec: OutputSpec) -> Result<Self, DomainError> {
        spec.validate()?;
        Ok(Self { spec })
    }

    /// Derive the job parameters for `source`
    pub fn plan(&self, source: &SourceDescriptor, input: Option<&Path>) -> Result<TranscodePlan, DomainError> {
        let parameters = ParameterDeriver::derive(source, &self.spec)?;
        debug!("Derived parameters: {:?}", parameters);
        let video_mux_tag = MuxCodecMapper::video(&parameters.video.codec).tag();
        let audio_mux_tag = parameters
            .audio
            .as_ref()
            .map(|audio| MuxCodecMapper::audio(&audio.codec).tag());
        let output_file_name = input.map(|path| {
            ContainerRules::output_file_name(path, &parameters.video.rate_control, parameters.container)
        });
        Ok(TranscodePlan {
            parameters,
            video_mux_tag,
            audio_mux_tag,
            output_file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(width: u32, height: u32, audio: bool) -> SourceDescriptor {
        SourceDescriptor {
            video: Some(VideoFormat {
                codec: "avc1.64001f".to_string(),
                width,
                height,
                framerate: Some(30.0),
                bitrate: None,
                description: None,
            }),
            audio: audio.then(|| AudioFormat {
                codec: DEFAULT_AUDIO_CODEC.to_string(),
                sample_rate: 44_100,
                channels: 2,
                bitrate: Some(100_000),
                description: None,
            }),
            total_frame_count: None,
            duration_us: None,
        }
    }

    #[test]
    fn test_plan_with_audio_and_file_name() {
        let interactor = PlanInteractor::new(OutputSpec::default()).unwrap();
        let plan = interactor
            .plan(&source(1920, 1080, true), Some(Path::new("/videos/holiday.mov")))
            .unwrap();
        assert_eq!(plan.video_mux_tag, "avc");
        assert_eq!(plan.audio_mux_tag, Some("aac"));
        assert_eq!(plan.output_file_name.as_deref(), Some("holiday_5.0Mbps.mp4"));

        let text = plan.describe();
        assert!(text.contains("1920x1080"));
        assert!(text.contains("VBR 5.0 Mbps"));
    }

    #[test]
    fn test_plan_without_audio() {
        let interactor = PlanInteractor::new(OutputSpec::default()).unwrap();
        let plan = interactor.plan(&source(640, 360, false), None).unwrap();
        assert!(plan.audio_mux_tag.is_none());
        assert!(plan.output_file_name.is_none());
        assert!(plan.describe().contains("Audio:         none"));
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let spec = OutputSpec {
            rate_control: RateControl::Quantizer(80),
            ..OutputSpec::default()
        };
        assert!(PlanInteractor::new(spec).is_err());
    }
}
