use klangnetz::nodes::effect::{BiquadFilterType, GAIN_PARAM};
use klangnetz::{
    AnalyserDescription, AudioBufferSourceDescription, BiquadFilterDescription, ChannelConfig, ChannelCountMode,
    ChannelInterpretation, ChannelMergerDescription, ChannelSplitterDescription, ConstantSourceDescription,
    ConvolverDescription, DelayDescription, DynamicsCompressorDescription, GainDescription, GraphDescription,
    GraphError, GraphUpdateKind, MediaElementAudioSourceDescription, OscillatorDescription, OscillatorType,
    RenderConfig, ResourceId, ScriptProcessorDescription, StereoPannerDescription, WireError, MAX_SAMPLE_RATE,
    MIN_SAMPLE_RATE,
};
use proptest::prelude::*;

/// Offset of the first node entry: sample rate, destination id, node count.
const FIRST_NODE: usize = 4 + 8 + 4;
/// Offset from the end of the last node's u32 payload: that payload, then both empty connection counts.
const PAYLOAD_FROM_END: usize = 4 + 4 + 4;

fn every_node_type() -> GraphDescription {
    let mut desc = GraphDescription::new(44_100.0, 2);
    let source = desc.add_node(
        AudioBufferSourceDescription::new(ResourceId(7))
            .with_start_frame(64)
            .with_stop_frame(u64::MAX)
            .with_loop(0.25, 0.75),
    );
    let media = desc.add_node(MediaElementAudioSourceDescription::new(ResourceId(8)));
    let gain = desc.add_node(GainDescription::new(-0.0));
    let biquad = desc.add_node(BiquadFilterDescription::new(BiquadFilterType::Peaking, 22_050.0));
    let convolver = desc.add_node(ConvolverDescription::new(ResourceId::NONE));
    let delay = desc.add_node(DelayDescription::new(0.0, 179.9));
    let compressor = desc.add_node(DynamicsCompressorDescription::default());
    let panner = desc.add_node(StereoPannerDescription::new(-1.0));
    let script = desc.add_node(ScriptProcessorDescription::new(ResourceId(9), 16384, 32, 1));
    let analyser = desc.add_node(AnalyserDescription::new(32768));
    let oscillator = desc.add_node(
        OscillatorDescription::new(OscillatorType::Triangle, -220.0)
            .with_start_frame(0)
            .with_stop_frame(48_000),
    );
    let constant = desc.add_node(ConstantSourceDescription::new(0.5).with_start_frame(128));
    let splitter = desc.add_node(ChannelSplitterDescription::new(2));
    let merger = desc.add_node(ChannelMergerDescription::new(2));

    desc.connect(source, gain).unwrap();
    desc.connect(media, gain).unwrap();
    desc.connect(gain, biquad).unwrap();
    desc.connect(biquad, convolver).unwrap();
    desc.connect(convolver, delay).unwrap();
    desc.connect(delay, compressor).unwrap();
    desc.connect(compressor, panner).unwrap();
    desc.connect(panner, script).unwrap();
    desc.connect(script, analyser).unwrap();
    desc.connect(analyser, desc.destination()).unwrap();
    desc.connect_param(media, gain, GAIN_PARAM).unwrap();
    desc.connect(constant, splitter).unwrap();
    desc.connect_ports(splitter, 1, merger, 0).unwrap();
    desc.connect_ports(oscillator, 0, merger, 1).unwrap();
    desc.connect_param_port(splitter, 0, gain, GAIN_PARAM).unwrap();
    desc.connect(merger, desc.destination()).unwrap();
    desc
}

#[test]
fn every_descriptor_round_trips() {
    let desc = every_node_type();
    let decoded = GraphDescription::decode(&desc.encode()).unwrap();
    assert_eq!(decoded, desc);
    assert_eq!(desc.classify_update(&decoded), GraphUpdateKind::None);
}

#[test]
fn every_truncation_is_rejected() {
    let bytes = every_node_type().encode();
    for len in 0..bytes.len() {
        assert!(GraphDescription::decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = GraphDescription::new(48_000.0, 2).encode();
    bytes.push(0);
    assert_eq!(GraphDescription::decode(&bytes), Err(WireError::TrailingBytes(1)));
}

#[test]
fn unknown_node_type_is_rejected() {
    let mut bytes = GraphDescription::new(48_000.0, 2).encode();
    bytes[FIRST_NODE] = 0xff;
    assert_eq!(GraphDescription::decode(&bytes), Err(WireError::UnknownNodeType(0xff)));
}

#[test]
fn reserved_node_id_is_rejected() {
    let mut bytes = GraphDescription::new(48_000.0, 2).encode();
    bytes[4..12].copy_from_slice(&0u64.to_le_bytes());
    assert_eq!(GraphDescription::decode(&bytes), Err(WireError::ReservedNodeId));
}

#[test]
fn payload_length_must_match() {
    let base = GraphDescription::new(48_000.0, 2).encode();
    let len_at = FIRST_NODE + 1 + 8;
    let declared = u32::from_le_bytes(base[len_at..len_at + 4].try_into().unwrap());

    let mut longer = base.clone();
    longer[len_at..len_at + 4].copy_from_slice(&(declared + 1).to_le_bytes());
    longer.extend_from_slice(&[0; 8]);
    assert!(GraphDescription::decode(&longer).is_err());

    let mut shorter = base;
    shorter[len_at..len_at + 4].copy_from_slice(&(declared - 1).to_le_bytes());
    assert!(GraphDescription::decode(&shorter).is_err());
}

#[test]
fn huge_counts_fail_before_reading() {
    let mut bytes = GraphDescription::new(48_000.0, 2).encode();
    bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        GraphDescription::decode(&bytes),
        Err(WireError::CountOutOfRange { .. })
    ));
}

#[test]
fn non_finite_sample_rate_is_rejected() {
    let mut bytes = GraphDescription::new(48_000.0, 2).encode();
    bytes[..4].copy_from_slice(&f32::NAN.to_le_bytes());
    assert!(GraphDescription::decode(&bytes).is_err());
}

#[test]
fn sample_rate_outside_supported_range_is_rejected() {
    for rate in [1.0e20f32, 768_001.0, 2_999.0, 0.0, -48_000.0] {
        let mut bytes = GraphDescription::new(48_000.0, 2).encode();
        bytes[..4].copy_from_slice(&rate.to_le_bytes());
        assert_eq!(
            GraphDescription::decode(&bytes),
            Err(WireError::OutOfRange("sample_rate")),
            "rate {rate}"
        );
    }
    for rate in [MIN_SAMPLE_RATE, MAX_SAMPLE_RATE] {
        let mut bytes = GraphDescription::new(48_000.0, 2).encode();
        bytes[..4].copy_from_slice(&rate.to_le_bytes());
        assert!(GraphDescription::decode(&bytes).is_ok());
    }
}

#[test]
fn constructed_sample_rate_is_clamped() {
    assert_eq!(GraphDescription::new(1.0e20, 2).sample_rate(), MAX_SAMPLE_RATE);
    assert_eq!(GraphDescription::new(f32::NAN, 2).sample_rate(), MIN_SAMPLE_RATE);
    assert_eq!(RenderConfig::new(1.0, 128).sample_rate, MIN_SAMPLE_RATE);
}

#[test]
fn out_of_range_descriptors_are_rejected() {
    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(DelayDescription::new(0.5, 180.0));
    assert!(GraphDescription::decode(&desc.encode()).is_err());

    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(AnalyserDescription::new(1000));
    assert!(GraphDescription::decode(&desc.encode()).is_err());

    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(ScriptProcessorDescription::new(ResourceId(1), 128, 2, 2));
    assert!(GraphDescription::decode(&desc.encode()).is_err());
}

#[test]
fn stereo_only_nodes_reject_max_mode() {
    let max = ChannelConfig::new(2, ChannelCountMode::Max, ChannelInterpretation::Speakers);

    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(StereoPannerDescription { channels: max, ..StereoPannerDescription::new(0.0) });
    assert_eq!(
        GraphDescription::decode(&desc.encode()),
        Err(WireError::OutOfRange("stereo panner channel_count_mode"))
    );

    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(ConvolverDescription { channels: max, ..ConvolverDescription::new(ResourceId::NONE) });
    assert_eq!(
        GraphDescription::decode(&desc.encode()),
        Err(WireError::OutOfRange("convolver channel_count_mode"))
    );

    let explicit = ChannelConfig::new(2, ChannelCountMode::Explicit, ChannelInterpretation::Speakers);
    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(StereoPannerDescription { channels: explicit, ..StereoPannerDescription::new(0.0) });
    desc.add_node(ConvolverDescription { channels: explicit, ..ConvolverDescription::new(ResourceId::NONE) });
    assert_eq!(GraphDescription::decode(&desc.encode()), Ok(desc.clone()));
}

#[test]
fn ports_are_checked_against_the_node_shape() {
    let mut desc = GraphDescription::new(48_000.0, 2);
    let splitter = desc.add_node(ChannelSplitterDescription::new(2));
    let merger = desc.add_node(ChannelMergerDescription::new(3));
    let gain = desc.add_node(GainDescription::new(1.0));

    assert!(desc.connect_ports(splitter, 1, merger, 2).is_ok());
    assert_eq!(
        desc.connect_ports(splitter, 2, merger, 0),
        Err(GraphError::InvalidOutput { node: splitter, port: 2 })
    );
    assert_eq!(
        desc.connect_ports(gain, 0, merger, 3),
        Err(GraphError::InvalidInput { node: merger, port: 3 })
    );
    assert_eq!(
        desc.connect_ports(gain, 1, merger, 0),
        Err(GraphError::InvalidOutput { node: gain, port: 1 })
    );
}

#[test]
fn splitter_and_merger_sizes_are_checked_on_decode() {
    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(ChannelSplitterDescription::new(32));
    let mut bytes = desc.encode();
    let payload = bytes.len() - PAYLOAD_FROM_END;
    bytes[payload..payload + 4].copy_from_slice(&0u32.to_le_bytes());
    assert_eq!(GraphDescription::decode(&bytes), Err(WireError::OutOfRange("number_of_outputs")));

    let mut desc = GraphDescription::new(48_000.0, 2);
    desc.add_node(ChannelMergerDescription::new(32));
    let mut bytes = desc.encode();
    let payload = bytes.len() - PAYLOAD_FROM_END;
    bytes[payload..payload + 4].copy_from_slice(&33u32.to_le_bytes());
    assert_eq!(GraphDescription::decode(&bytes), Err(WireError::OutOfRange("number_of_inputs")));
}

#[test]
fn node_changes_are_classified_by_severity() {
    let mut desc = GraphDescription::new(48_000.0, 2);
    let gain = desc.add_node(GainDescription::new(1.0));
    let convolver = desc.add_node(ConvolverDescription::new(ResourceId(1)));
    let analyser = desc.add_node(AnalyserDescription::new(2048));
    let oscillator = desc.add_node(OscillatorDescription::new(OscillatorType::Sine, 440.0));

    let classify = |id, node: klangnetz::GraphNodeDescription| {
        let mut next = desc.clone();
        next.set_node(id, node).unwrap();
        desc.classify_update(&next)
    };

    assert_eq!(classify(gain, GainDescription::new(0.5).into()), GraphUpdateKind::Parameter);
    let wider = GainDescription {
        channels: ChannelConfig::new(4, ChannelCountMode::Explicit, ChannelInterpretation::Discrete),
        gain: 1.0,
    };
    assert_eq!(classify(gain, wider.into()), GraphUpdateKind::Topology);
    assert_eq!(
        classify(convolver, ConvolverDescription::new(ResourceId(2)).into()),
        GraphUpdateKind::RebuildRequired
    );
    assert_eq!(
        classify(convolver, ConvolverDescription { normalize: false, ..ConvolverDescription::new(ResourceId(1)) }.into()),
        GraphUpdateKind::Parameter
    );
    assert_eq!(classify(analyser, AnalyserDescription::new(4096).into()), GraphUpdateKind::RebuildRequired);
    assert_eq!(
        classify(oscillator, OscillatorDescription::new(OscillatorType::Square, 440.0).into()),
        GraphUpdateKind::Parameter
    );
    assert_eq!(classify(gain, ConvolverDescription::new(ResourceId(1)).into()), GraphUpdateKind::RebuildRequired);
}

fn channel_config() -> impl Strategy<Value = ChannelConfig> {
    (
        1u32..=32,
        prop_oneof![
            Just(ChannelCountMode::Max),
            Just(ChannelCountMode::ClampedMax),
            Just(ChannelCountMode::Explicit)
        ],
        prop_oneof![Just(ChannelInterpretation::Speakers), Just(ChannelInterpretation::Discrete)],
    )
        .prop_map(|(count, mode, interpretation)| ChannelConfig::new(count, mode, interpretation))
}

proptest! {
    #[test]
    fn gain_chains_round_trip(
        gains in prop::collection::vec(-1.0e6f32..1.0e6, 0..16),
        channels in channel_config(),
        delay in 0.0f32..10.0,
    ) {
        let mut desc = GraphDescription::new(48_000.0, 2);
        let mut previous = desc.destination();
        for gain in gains {
            let id = desc.add_node(GainDescription { channels, gain });
            desc.connect(id, previous).unwrap();
            previous = id;
        }
        let delay = desc.add_node(DelayDescription { channels, ..DelayDescription::new(delay, 10.0) });
        desc.connect(delay, previous).unwrap();

        let decoded = GraphDescription::decode(&desc.encode()).unwrap();
        prop_assert_eq!(decoded, desc);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = GraphDescription::decode(&bytes);
    }
}
