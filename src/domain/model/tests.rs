// Unit tests for domain models

#[cfg(test)]
mod tests {
    use crate::domain::errors::*;
    use crate::domain::model::*;

    #[test]
    fn test_track_kind_index_and_display() {
        assert_eq!(TrackKind::Video.index(), 0);
        assert_eq!(TrackKind::Audio.index(), 1);
        assert_eq!(TrackKind::Audio.to_string(), "audio");
    }

    #[test]
    fn test_container_parse() {
        assert_eq!(Container::parse("mp4").unwrap(), Container::Mp4);
        assert_eq!(Container::parse(".WEBM").unwrap(), Container::Webm);
        assert!(matches!(Container::parse("avi"), Err(DomainError::BadArgs(_))));
        assert_eq!(Container::Webm.extension(), ".webm");
    }

    #[test]
    fn test_timestamp_unit_conversion() {
        assert_eq!(TimestampUnit::Microseconds.from_micros(33_366), 33_366);
        assert_eq!(TimestampUnit::Milliseconds.from_micros(33_366), 33);
        assert_eq!(TimestampUnit::Timescale(90_000).from_micros(1_000_000), 90_000);
        assert_eq!(TimestampUnit::Timescale(48_000).from_micros(21_333), 1_023);
        assert_eq!(TimestampUnit::Milliseconds.from_micros(0), 0);
    }

    #[test]
    fn test_sample_ordering_key_prefers_decode_timestamp() {
        let mut sample = EncodedSample {
            kind: TrackKind::Video,
            chunk_type: ChunkType::Delta,
            timestamp_us: 66_000,
            decode_timestamp_us: Some(33_000),
            duration_us: 33_000,
            data: Vec::new(),
        };
        assert_eq!(sample.ordering_key(), 33_000);
        sample.decode_timestamp_us = None;
        assert_eq!(sample.ordering_key(), 66_000);
    }

    #[test]
    fn test_rate_control_accessors() {
        assert_eq!(RateControl::Variable(5_000_000).bitrate(), Some(5_000_000));
        assert_eq!(RateControl::Quantizer(23).bitrate(), None);
        assert_eq!(RateControl::Quantizer(23).quantizer(), Some(23));
    }

    #[test]
    fn test_output_spec_validation() {
        assert!(OutputSpec::default().validate().is_ok());

        let spec = OutputSpec {
            rate_control: RateControl::Constant(0),
            ..OutputSpec::default()
        };
        assert!(spec.validate().is_err());

        let spec = OutputSpec {
            framerate_mode: FramerateMode::Fixed,
            framerate: 0.0,
            ..OutputSpec::default()
        };
        assert!(spec.validate().is_err());

        let spec = OutputSpec {
            rate_control: RateControl::Quantizer(80),
            ..OutputSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_output_spec_from_toml() {
        let spec: OutputSpec = toml::from_str(
            r#"
            width = 1280
            video_codec = "vp09.00.31.08"
            audio_codec = "opus"
            rate_control = { mode = "quantizer", value = 28 }
            "#,
        )
        .unwrap();
        assert_eq!(spec.width, Some(1280));
        assert_eq!(spec.height, None);
        assert_eq!(spec.rate_control, RateControl::Quantizer(28));
        assert_eq!(spec.framerate_mode, FramerateMode::PreserveOriginal);
    }

    #[test]
    fn test_mux_codec_tags() {
        assert_eq!(MuxCodec::Avc.tag(), "avc");
        assert_eq!(MuxCodec::Vp9.tag(), "V_VP9");
        assert_eq!(MuxCodec::Opus.tag(), "A_OPUS");
    }

    #[test]
    fn test_decoded_frame_debug_omits_payload() {
        let frame = DecodedFrame {
            kind: TrackKind::Video,
            timestamp_us: 0,
            duration_us: 33_333,
            audio_layout: None,
            payload: Box::new(vec![0u8; 16]),
        };
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("timestamp_us: 0"));
        assert!(!rendered.contains("payload"));
    }
}
